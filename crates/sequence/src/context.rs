use std::sync::Arc;

use storyreel_producer::{DEFAULT_VOICE_ID, Gateway};

use crate::prompts::PromptBook;

/// Everything a segment needs to produce content: the shared gateway, prompt templates
/// and the speech voice.
#[derive(Clone)]
pub struct GenerationContext {
    gateway: Arc<Gateway>,
    prompts: Arc<PromptBook>,
    voice_id: String,
}

impl GenerationContext {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            prompts: Arc::new(PromptBook::default()),
            voice_id: DEFAULT_VOICE_ID.to_string(),
        }
    }

    pub fn with_prompts(mut self, prompts: PromptBook) -> Self {
        self.prompts = Arc::new(prompts);
        self
    }

    pub fn with_voice_id(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn prompts(&self) -> &PromptBook {
        &self.prompts
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }
}
