use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storyreel_producer::{
    BoxFuture, Capability, GateLimits, Gateway, ProduceRequest, Producer, ProducerError,
    ProducerResult,
};

use crate::context::GenerationContext;

type Reply = Box<dyn Fn(&ProduceRequest) -> ProducerResult<String> + Send + Sync>;
type Delay = Box<dyn Fn(&ProduceRequest) -> Duration + Send + Sync>;

/// Scriptable in-process producer recording every request it sees.
pub(crate) struct MockProducer {
    capability: Capability,
    reply: Reply,
    delay: Delay,
    pub(crate) calls: AtomicUsize,
    pub(crate) requests: Mutex<Vec<ProduceRequest>>,
    pub(crate) completed: Mutex<Vec<ProduceRequest>>,
}

impl MockProducer {
    pub(crate) fn new(
        capability: Capability,
        reply: impl Fn(&ProduceRequest) -> ProducerResult<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            capability,
            reply: Box::new(reply),
            delay: Box::new(|_: &ProduceRequest| Duration::ZERO),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Media producers answer with `{asset_name}.png` / `{asset_name}.mp3`.
    pub(crate) fn media(capability: Capability) -> Self {
        Self::new(capability, |request| match request {
            ProduceRequest::Image { asset_name, .. } => Ok(format!("{asset_name}.png")),
            ProduceRequest::Speech { asset_name, .. } => Ok(format!("{asset_name}.mp3")),
            ProduceRequest::Script { prompt } => Ok(prompt.clone()),
        })
    }

    pub(crate) fn failing(capability: Capability) -> Self {
        Self::new(capability, move |_| {
            Err(ProducerError::Rejected {
                stage: "mock-producer",
                capability,
                status: 500,
                body: "mock failure".to_string(),
            })
        })
    }

    pub(crate) fn with_delay(
        mut self,
        delay: impl Fn(&ProduceRequest) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.delay = Box::new(delay);
        self
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn script_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter_map(|request| match request {
                ProduceRequest::Script { prompt } => Some(prompt.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Producer for MockProducer {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn produce<'a>(&'a self, request: &'a ProduceRequest) -> BoxFuture<'a, ProducerResult<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            tokio::time::sleep((self.delay)(request)).await;
            self.completed
                .lock()
                .expect("completed lock")
                .push(request.clone());
            (self.reply)(request)
        })
    }
}

pub(crate) struct MockStudio {
    pub(crate) context: GenerationContext,
    pub(crate) script: Arc<MockProducer>,
    pub(crate) image: Arc<MockProducer>,
    pub(crate) speech: Arc<MockProducer>,
}

impl MockStudio {
    pub(crate) fn new(script: MockProducer, image: MockProducer, speech: MockProducer) -> Self {
        let script = Arc::new(script);
        let image = Arc::new(image);
        let speech = Arc::new(speech);
        let gateway = Gateway::new(GateLimits::uniform(8).with_overload_pause(Duration::ZERO))
            .with_producer(script.clone())
            .with_producer(image.clone())
            .with_producer(speech.clone());

        Self {
            context: GenerationContext::new(Arc::new(gateway)).with_voice_id("test-voice"),
            script,
            image,
            speech,
        }
    }

    /// Script capability answers `reply(prompt)`; media capabilities echo asset names.
    pub(crate) fn with_script(
        reply: impl Fn(&str) -> ProducerResult<String> + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            MockProducer::new(Capability::Script, move |request| match request {
                ProduceRequest::Script { prompt } => reply(prompt.as_str()),
                _ => Ok(String::new()),
            }),
            MockProducer::media(Capability::Image),
            MockProducer::media(Capability::Speech),
        )
    }
}

pub(crate) fn script_failure() -> ProducerError {
    ProducerError::Rejected {
        stage: "mock-producer",
        capability: Capability::Script,
        status: 401,
        body: "invalid api key".to_string(),
    }
}
