use std::future::Future;
use std::pin::Pin;

use super::capability::{Capability, ProduceRequest};
use super::error::{ProducerResult, RequestMismatchSnafu};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An external generation function: script completion, image synthesis or speech synthesis.
///
/// Implementations return the produced content: script text for [`Capability::Script`],
/// a content reference (file path or URI) for the media capabilities.
pub trait Producer: Send + Sync {
    fn capability(&self) -> Capability;
    fn produce<'a>(&'a self, request: &'a ProduceRequest) -> BoxFuture<'a, ProducerResult<String>>;
}

/// Failure returned when a producer receives a request for another capability.
pub(crate) fn mismatched_request<T>(
    stage: &'static str,
    capability: Capability,
    request: &ProduceRequest,
) -> ProducerResult<T> {
    RequestMismatchSnafu {
        stage,
        capability,
        actual: request.capability(),
    }
    .fail()
}
