use snafu::Snafu;

use super::capability::Capability;

/// Substring the providers put in their error body when a model is temporarily saturated.
pub const OVERLOADED_SIGNATURE: &str = "currently overloaded";

pub type ProducerResult<T> = Result<T, ProducerError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProducerError {
    #[snafu(display("missing API key for {capability} provider"))]
    MissingApiKey {
        stage: &'static str,
        capability: Capability,
    },
    #[snafu(display("no producer is registered for {capability}"))]
    MissingProducer {
        stage: &'static str,
        capability: Capability,
    },
    #[snafu(display("{capability} producer cannot serve a {actual} request"))]
    RequestMismatch {
        stage: &'static str,
        capability: Capability,
        actual: Capability,
    },
    #[snafu(display("{capability} provider is overloaded: {message}"))]
    Overloaded {
        stage: &'static str,
        capability: Capability,
        message: String,
    },
    #[snafu(display("{capability} provider returned status {status}: {body}"))]
    Rejected {
        stage: &'static str,
        capability: Capability,
        status: u16,
        body: String,
    },
    #[snafu(display("{capability} request failed on `{stage}`, {source}"))]
    Http {
        stage: &'static str,
        capability: Capability,
        source: reqwest::Error,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("script completion failed on `{stage}`, {source}"))]
    Prompt {
        stage: &'static str,
        source: rig::completion::PromptError,
    },
    #[snafu(display("{capability} provider sent an unusable response: {details}"))]
    MalformedResponse {
        stage: &'static str,
        capability: Capability,
        details: String,
    },
    #[snafu(display("failed to create asset directory at {path}"))]
    CreateAssetDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write asset to {path}"))]
    WriteAsset {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("admission gate for {capability} is closed"))]
    GateClosed {
        stage: &'static str,
        capability: Capability,
        source: tokio::sync::AcquireError,
    },
}

impl ProducerError {
    /// Only a saturated provider is worth re-issuing the same request for.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProducerError::Overloaded { .. })
    }
}

/// Maps a non-success provider body onto the overloaded/permanent split.
pub(crate) fn classify_rejection(
    stage: &'static str,
    capability: Capability,
    status: u16,
    body: String,
) -> ProducerError {
    if body.contains(OVERLOADED_SIGNATURE) {
        ProducerError::Overloaded {
            stage,
            capability,
            message: body,
        }
    } else {
        ProducerError::Rejected {
            stage,
            capability,
            status,
            body,
        }
    }
}
