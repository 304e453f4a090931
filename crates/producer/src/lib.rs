pub mod assets;
pub mod capability;
pub mod eleven;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod openai;
pub mod provider;

pub use assets::AssetDirectory;
pub use capability::{Capability, ProduceRequest};
pub use eleven::{
    DEFAULT_ELEVENLABS_ENDPOINT, DEFAULT_VOICE_ID, ElevenLabsConfig, ElevenLabsSpeechProducer,
};
pub use error::{OVERLOADED_SIGNATURE, ProducerError, ProducerResult};
pub use gate::{AdmissionGate, AdmissionPermit, DEFAULT_CEILING};
pub use gateway::{GateLimits, Gateway};
pub use openai::{
    DEFAULT_IMAGE_MODEL, DEFAULT_IMAGE_SIZE, DEFAULT_OPENAI_ENDPOINT, DEFAULT_SCRIPT_MODEL,
    OpenAiConfig, OpenAiImageProducer, RigScriptProducer,
};
pub use provider::{BoxFuture, Producer};
