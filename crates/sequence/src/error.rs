use snafu::Snafu;
use storyreel_producer::ProducerError;
use storyreel_storage::{ElementKind, StorageError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SequenceError {
    #[snafu(display("index {index} is out of range for length {len}"))]
    OutOfRange {
        stage: &'static str,
        index: usize,
        len: usize,
    },
    #[snafu(display("{kind} version {version} does not exist"))]
    MissingVersion {
        stage: &'static str,
        kind: ElementKind,
        version: usize,
    },
    #[snafu(display("segment at position {position} has no active text"))]
    NotReady {
        stage: &'static str,
        position: usize,
    },
    #[snafu(display("script reply is not a single non-empty line: {reply:?}"))]
    UnusableSentence { stage: &'static str, reply: String },
    #[snafu(display("sequence '{id}' was not found"))]
    UnknownSequence { stage: &'static str, id: String },
    #[snafu(display("production failed at {stage}: {source}"))]
    Producer {
        stage: &'static str,
        source: ProducerError,
    },
    #[snafu(display("storage failed at {stage}: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to serialize {what}"))]
    Serialize {
        stage: &'static str,
        what: &'static str,
        source: serde_json::Error,
    },
}

pub type SequenceResult<T> = Result<T, SequenceError>;
