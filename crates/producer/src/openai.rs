use rig::completion::Prompt;
use rig::prelude::CompletionClient;
use rig::providers::openai;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use super::assets::AssetDirectory;
use super::capability::{Capability, ProduceRequest};
use super::error::{
    HttpClientSnafu, HttpSnafu, MalformedResponseSnafu, MissingApiKeySnafu, OVERLOADED_SIGNATURE,
    ProducerError, ProducerResult, PromptSnafu, classify_rejection,
};
use super::provider::{BoxFuture, Producer, mismatched_request};

pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_SCRIPT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_IMAGE_MODEL: &str = "dall-e-3";
pub const DEFAULT_IMAGE_SIZE: &str = "1024x1024";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub endpoint: String,
    pub script_model: String,
    pub image_model: String,
    pub image_size: String,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            endpoint: DEFAULT_OPENAI_ENDPOINT.to_string(),
            script_model: DEFAULT_SCRIPT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            image_size: DEFAULT_IMAGE_SIZE.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_script_model(mut self, model: impl Into<String>) -> Self {
        self.script_model = model.into();
        self
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    pub fn with_image_size(mut self, size: impl Into<String>) -> Self {
        self.image_size = size.into();
        self
    }
}

/// Script capability backed by a Rig OpenAI agent.
pub struct RigScriptProducer {
    config: OpenAiConfig,
}

impl RigScriptProducer {
    pub fn new(config: OpenAiConfig) -> ProducerResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-script-new",
                capability: Capability::Script,
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &OpenAiConfig) -> ProducerResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn complete(&self, prompt: &str) -> ProducerResult<String> {
        let client = Self::build_client(&self.config)?;
        let agent = client.agent(self.config.script_model.as_str()).build();

        tracing::debug!(model = %self.config.script_model, "sending script completion");
        match agent.prompt(prompt).await {
            Ok(text) => Ok(text),
            Err(source) => {
                let message = source.to_string();
                if message.contains(OVERLOADED_SIGNATURE) {
                    return Err(ProducerError::Overloaded {
                        stage: "script-complete",
                        capability: Capability::Script,
                        message,
                    });
                }
                Err(source).context(PromptSnafu {
                    stage: "script-complete",
                })
            }
        }
    }
}

impl Producer for RigScriptProducer {
    fn capability(&self) -> Capability {
        Capability::Script
    }

    fn produce<'a>(&'a self, request: &'a ProduceRequest) -> BoxFuture<'a, ProducerResult<String>> {
        Box::pin(async move {
            match request {
                ProduceRequest::Script { prompt } => self.complete(prompt).await,
                other => mismatched_request("rig-script-produce", Capability::Script, other),
            }
        })
    }
}

#[derive(Debug, Serialize)]
struct ImageGenerationBody<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    data: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    url: Option<String>,
}

/// Image capability calling the OpenAI image endpoint and downloading the result.
pub struct OpenAiImageProducer {
    config: OpenAiConfig,
    http: reqwest::Client,
    assets: AssetDirectory,
}

impl OpenAiImageProducer {
    pub fn new(config: OpenAiConfig, assets: AssetDirectory) -> ProducerResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "openai-image-new",
                capability: Capability::Image,
            }
        );

        Ok(Self {
            config,
            http: reqwest::Client::new(),
            assets,
        })
    }

    async fn generate(&self, prompt: &str, asset_name: &str) -> ProducerResult<String> {
        let url = format!("{}/images/generations", self.config.endpoint);
        let body = ImageGenerationBody {
            model: &self.config.image_model,
            prompt,
            n: 1,
            size: &self.config.image_size,
        };

        tracing::debug!(asset_name, "requesting image generation");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context(HttpSnafu {
                stage: "image-send",
                capability: Capability::Image,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_rejection(
                "image-status",
                Capability::Image,
                status.as_u16(),
                body,
            ));
        }

        let payload: ImageGenerationResponse = response.json().await.context(HttpSnafu {
            stage: "image-parse",
            capability: Capability::Image,
        })?;
        let Some(image_url) = payload.data.into_iter().find_map(|image| image.url) else {
            return MalformedResponseSnafu {
                stage: "image-url",
                capability: Capability::Image,
                details: "no image url in response".to_string(),
            }
            .fail();
        };

        let download = self.http.get(&image_url).send().await.context(HttpSnafu {
            stage: "image-download",
            capability: Capability::Image,
        })?;
        let status = download.status();
        if !status.is_success() {
            let body = download.text().await.unwrap_or_default();
            return Err(classify_rejection(
                "image-download-status",
                Capability::Image,
                status.as_u16(),
                body,
            ));
        }
        let bytes = download.bytes().await.context(HttpSnafu {
            stage: "image-download-body",
            capability: Capability::Image,
        })?;

        self.assets.write(asset_name, &bytes).await
    }
}

impl Producer for OpenAiImageProducer {
    fn capability(&self) -> Capability {
        Capability::Image
    }

    fn produce<'a>(&'a self, request: &'a ProduceRequest) -> BoxFuture<'a, ProducerResult<String>> {
        Box::pin(async move {
            match request {
                ProduceRequest::Image { prompt, asset_name } => {
                    self.generate(prompt, asset_name).await
                }
                other => mismatched_request("openai-image-produce", Capability::Image, other),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_rejected() {
        let result = RigScriptProducer::new(OpenAiConfig::new("   "));
        assert!(matches!(
            result,
            Err(ProducerError::MissingApiKey {
                capability: Capability::Script,
                ..
            })
        ));
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let config = OpenAiConfig::new("key").with_endpoint("http://localhost:8080/v1/");
        assert_eq!(config.endpoint, "http://localhost:8080/v1");
    }

    #[tokio::test]
    async fn image_producer_refuses_speech_requests() {
        let producer = OpenAiImageProducer::new(
            OpenAiConfig::new("key"),
            AssetDirectory::new("images", "png"),
        )
        .expect("producer");
        let request = ProduceRequest::speech("voice", "text", "asset");

        let error = producer.produce(&request).await.expect_err("mismatch");

        assert!(matches!(
            error,
            ProducerError::RequestMismatch {
                actual: Capability::Speech,
                ..
            }
        ));
    }
}
