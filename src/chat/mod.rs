pub mod events;
pub mod orchestrator;
pub mod prompt;

pub use events::{SourceRef, StreamEvent, Usage};
pub use orchestrator::ChatOrchestrator;
pub use prompt::{CitationStyle, PromptAssembler};
