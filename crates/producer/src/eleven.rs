use serde::Serialize;
use snafu::{ResultExt, ensure};

use super::assets::AssetDirectory;
use super::capability::{Capability, ProduceRequest};
use super::error::{
    HttpSnafu, MalformedResponseSnafu, MissingApiKeySnafu, ProducerResult, classify_rejection,
};
use super::provider::{BoxFuture, Producer, mismatched_request};

pub const DEFAULT_ELEVENLABS_ENDPOINT: &str = "https://api.elevenlabs.io/v1";
/// The "Antoni" stock voice.
pub const DEFAULT_VOICE_ID: &str = "ErXwobaYiN019PkySvjV";

#[derive(Debug, Clone, PartialEq)]
pub struct ElevenLabsConfig {
    pub api_key: String,
    pub endpoint: String,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl ElevenLabsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            endpoint: DEFAULT_ELEVENLABS_ENDPOINT.to_string(),
            stability: 0.5,
            similarity_boost: 0.0,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

#[derive(Debug, Serialize)]
struct SpeechBody<'a> {
    text: &'a str,
    voice_settings: VoiceSettings,
}

/// Speech capability backed by the ElevenLabs text-to-speech endpoint.
pub struct ElevenLabsSpeechProducer {
    config: ElevenLabsConfig,
    http: reqwest::Client,
    assets: AssetDirectory,
}

impl ElevenLabsSpeechProducer {
    pub fn new(config: ElevenLabsConfig, assets: AssetDirectory) -> ProducerResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "elevenlabs-new",
                capability: Capability::Speech,
            }
        );

        Ok(Self {
            config,
            http: reqwest::Client::new(),
            assets,
        })
    }

    async fn synthesize(
        &self,
        voice_id: &str,
        text: &str,
        asset_name: &str,
    ) -> ProducerResult<String> {
        let url = format!("{}/text-to-speech/{voice_id}", self.config.endpoint);
        let body = SpeechBody {
            text,
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
        };

        tracing::debug!(voice_id, asset_name, "requesting speech synthesis");
        let response = self
            .http
            .post(&url)
            .header("xi-api-key", &self.config.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&body)
            .send()
            .await
            .context(HttpSnafu {
                stage: "speech-send",
                capability: Capability::Speech,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_rejection(
                "speech-status",
                Capability::Speech,
                status.as_u16(),
                body,
            ));
        }

        let bytes = response.bytes().await.context(HttpSnafu {
            stage: "speech-body",
            capability: Capability::Speech,
        })?;
        if bytes.is_empty() {
            return MalformedResponseSnafu {
                stage: "speech-body-empty",
                capability: Capability::Speech,
                details: "provider returned no audio".to_string(),
            }
            .fail();
        }

        self.assets.write(asset_name, &bytes).await
    }
}

impl Producer for ElevenLabsSpeechProducer {
    fn capability(&self) -> Capability {
        Capability::Speech
    }

    fn produce<'a>(&'a self, request: &'a ProduceRequest) -> BoxFuture<'a, ProducerResult<String>> {
        Box::pin(async move {
            match request {
                ProduceRequest::Speech {
                    voice_id,
                    text,
                    asset_name,
                } => self.synthesize(voice_id, text, asset_name).await,
                other => mismatched_request("elevenlabs-produce", Capability::Speech, other),
            }
        })
    }
}
