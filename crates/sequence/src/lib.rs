pub mod context;
pub mod error;
pub mod persist;
pub mod prompts;
pub mod segment;
pub mod sequence;
pub mod versions;

#[cfg(test)]
mod testing;

pub use context::GenerationContext;
pub use error::{SequenceError, SequenceResult};
pub use persist::{load_sequence, save_sequence, update_sequence};
pub use prompts::PromptBook;
pub use segment::{Segment, Snapshot};
pub use sequence::{Sequence, SequenceState};
pub use storyreel_storage::ElementKind;
pub use versions::VersionedElement;
