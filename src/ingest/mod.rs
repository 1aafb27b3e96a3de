pub mod coordinator;
pub mod summary;

pub use coordinator::{IngestRequest, IngestionCoordinator};
pub use summary::DocumentSummaryService;
