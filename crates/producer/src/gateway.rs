use std::sync::Arc;
use std::time::Duration;

use snafu::OptionExt;

use super::capability::{Capability, ProduceRequest};
use super::error::{MissingProducerSnafu, ProducerResult};
use super::gate::{AdmissionGate, DEFAULT_CEILING};
use super::provider::Producer;

/// Per-capability ceilings plus the pause taken before re-issuing an overloaded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateLimits {
    pub script: usize,
    pub image: usize,
    pub speech: usize,
    pub overload_pause: Duration,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            script: DEFAULT_CEILING,
            image: DEFAULT_CEILING,
            speech: DEFAULT_CEILING,
            overload_pause: Duration::from_millis(500),
        }
    }
}

impl GateLimits {
    pub fn uniform(ceiling: usize) -> Self {
        Self {
            script: ceiling,
            image: ceiling,
            speech: ceiling,
            ..Self::default()
        }
    }

    pub fn with_overload_pause(mut self, pause: Duration) -> Self {
        self.overload_pause = pause;
        self
    }

    pub fn ceiling(&self, capability: Capability) -> usize {
        match capability {
            Capability::Script => self.script,
            Capability::Image => self.image,
            Capability::Speech => self.speech,
        }
    }
}

struct Lane {
    gate: AdmissionGate,
    producer: Option<Arc<dyn Producer>>,
}

impl Lane {
    fn new(capability: Capability, ceiling: usize) -> Self {
        Self {
            gate: AdmissionGate::new(capability, ceiling),
            producer: None,
        }
    }
}

/// Uniform `produce(request)` front for every capability, throttled per capability.
pub struct Gateway {
    script: Lane,
    image: Lane,
    speech: Lane,
    overload_pause: Duration,
}

impl Gateway {
    pub fn new(limits: GateLimits) -> Self {
        Self {
            script: Lane::new(Capability::Script, limits.script),
            image: Lane::new(Capability::Image, limits.image),
            speech: Lane::new(Capability::Speech, limits.speech),
            overload_pause: limits.overload_pause,
        }
    }

    /// Registers `producer` on the lane matching its capability, replacing any previous one.
    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        let capability = producer.capability();
        self.lane_mut(capability).producer = Some(producer);
        self
    }

    pub fn has_producer(&self, capability: Capability) -> bool {
        self.lane(capability).producer.is_some()
    }

    pub fn gate(&self, capability: Capability) -> &AdmissionGate {
        &self.lane(capability).gate
    }

    pub fn in_flight(&self, capability: Capability) -> usize {
        self.lane(capability).gate.in_flight()
    }

    pub async fn script(&self, prompt: impl Into<String>) -> ProducerResult<String> {
        self.produce(ProduceRequest::script(prompt)).await
    }

    pub async fn image(
        &self,
        prompt: impl Into<String>,
        asset_name: impl Into<String>,
    ) -> ProducerResult<String> {
        self.produce(ProduceRequest::image(prompt, asset_name)).await
    }

    pub async fn speech(
        &self,
        voice_id: impl Into<String>,
        text: impl Into<String>,
        asset_name: impl Into<String>,
    ) -> ProducerResult<String> {
        self.produce(ProduceRequest::speech(voice_id, text, asset_name))
            .await
    }

    /// Issues `request` once admitted by its capability's gate.
    ///
    /// An overloaded provider gets the same request again, without bound, until it
    /// answers or fails for any other reason. Every other failure is returned as is.
    pub async fn produce(&self, request: ProduceRequest) -> ProducerResult<String> {
        let capability = request.capability();
        let lane = self.lane(capability);
        let producer = lane.producer.as_ref().context(MissingProducerSnafu {
            stage: "gateway-produce",
            capability,
        })?;

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let outcome = {
                let _permit = lane.gate.acquire().await?;
                producer.produce(&request).await
            };

            match outcome {
                Ok(content) => {
                    tracing::debug!(capability = %capability, attempt, "production succeeded");
                    return Ok(content);
                }
                Err(error) if error.is_transient() => {
                    tracing::warn!(
                        capability = %capability,
                        attempt,
                        error = %error,
                        "provider overloaded; re-issuing request"
                    );
                    tokio::time::sleep(self.overload_pause).await;
                }
                Err(error) => {
                    tracing::error!(
                        capability = %capability,
                        attempt,
                        error = %error,
                        "production failed"
                    );
                    return Err(error);
                }
            }
        }
    }

    fn lane(&self, capability: Capability) -> &Lane {
        match capability {
            Capability::Script => &self.script,
            Capability::Image => &self.image,
            Capability::Speech => &self.speech,
        }
    }

    fn lane_mut(&mut self, capability: Capability) -> &mut Lane {
        match capability {
            Capability::Script => &mut self.script,
            Capability::Image => &mut self.image,
            Capability::Speech => &mut self.speech,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;

    use super::*;
    use crate::error::ProducerError;
    use crate::provider::BoxFuture;

    struct CountingProducer {
        capability: Capability,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        overloaded_calls: usize,
        permanent_failure: bool,
    }

    impl CountingProducer {
        fn new(capability: Capability) -> Self {
            Self {
                capability,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                overloaded_calls: 0,
                permanent_failure: false,
            }
        }
    }

    impl Producer for CountingProducer {
        fn capability(&self) -> Capability {
            self.capability
        }

        fn produce<'a>(
            &'a self,
            request: &'a ProduceRequest,
        ) -> BoxFuture<'a, ProducerResult<String>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);

                if self.permanent_failure {
                    return Err(ProducerError::Rejected {
                        stage: "counting-producer",
                        capability: self.capability,
                        status: 401,
                        body: "invalid api key".to_string(),
                    });
                }
                if call < self.overloaded_calls {
                    return Err(ProducerError::Overloaded {
                        stage: "counting-producer",
                        capability: self.capability,
                        message: "That model is currently overloaded".to_string(),
                    });
                }

                match request {
                    ProduceRequest::Script { prompt } => Ok(format!("script for {prompt}")),
                    ProduceRequest::Image { asset_name, .. } => Ok(format!("{asset_name}.png")),
                    ProduceRequest::Speech { asset_name, .. } => Ok(format!("{asset_name}.mp3")),
                }
            })
        }
    }

    fn quick_limits(ceiling: usize) -> GateLimits {
        GateLimits::uniform(ceiling).with_overload_pause(Duration::ZERO)
    }

    #[tokio::test]
    async fn never_exceeds_ceiling_and_everything_completes() {
        let ceiling = 3;
        let producer = Arc::new(CountingProducer::new(Capability::Image));
        let gateway = Gateway::new(quick_limits(ceiling)).with_producer(producer.clone());

        let requests = (0..ceiling + 2)
            .map(|index| gateway.image(format!("prompt {index}"), format!("asset_{index}")));
        let results = join_all(requests).await;

        assert_eq!(results.len(), ceiling + 2);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(producer.peak.load(Ordering::SeqCst), ceiling);
        assert_eq!(gateway.in_flight(Capability::Image), 0);
    }

    #[tokio::test]
    async fn capabilities_are_throttled_independently() {
        let script = Arc::new(CountingProducer::new(Capability::Script));
        let speech = Arc::new(CountingProducer::new(Capability::Speech));
        let gateway = Gateway::new(quick_limits(1))
            .with_producer(script.clone())
            .with_producer(speech.clone());

        let (first, second) = futures::join!(
            gateway.script("subject"),
            gateway.speech("voice", "hello", "line_0")
        );

        assert_eq!(first.expect("script"), "script for subject");
        assert_eq!(second.expect("speech"), "line_0.mp3");
        assert_eq!(script.peak.load(Ordering::SeqCst), 1);
        assert_eq!(speech.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overloaded_requests_are_reissued_until_success() {
        let mut producer = CountingProducer::new(Capability::Script);
        producer.overloaded_calls = 4;
        let producer = Arc::new(producer);
        let gateway = Gateway::new(quick_limits(3)).with_producer(producer.clone());

        let content = gateway.script("lettuce").await.expect("eventual success");

        assert_eq!(content, "script for lettuce");
        assert_eq!(producer.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_failures_surface_without_retry() {
        let mut producer = CountingProducer::new(Capability::Script);
        producer.permanent_failure = true;
        let producer = Arc::new(producer);
        let gateway = Gateway::new(quick_limits(3)).with_producer(producer.clone());

        let error = gateway.script("lettuce").await.expect_err("must fail");

        assert!(matches!(error, ProducerError::Rejected { status: 401, .. }));
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.in_flight(Capability::Script), 0);
    }

    #[tokio::test]
    async fn registration_routes_by_capability_and_replaces() {
        let first = Arc::new(CountingProducer::new(Capability::Script));
        let second = Arc::new(CountingProducer::new(Capability::Script));
        let gateway = Gateway::new(quick_limits(2))
            .with_producer(first.clone())
            .with_producer(second.clone());

        assert!(gateway.has_producer(Capability::Script));
        assert!(!gateway.has_producer(Capability::Image));
        gateway.script("lettuce").await.expect("script");

        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_producer_is_reported() {
        let gateway = Gateway::new(GateLimits::default());

        let error = gateway.script("anything").await.expect_err("no producer");

        assert!(matches!(
            error,
            ProducerError::MissingProducer {
                capability: Capability::Script,
                ..
            }
        ));
    }
}
