pub mod blob;
pub mod cache;
pub mod graph;
pub mod keyword;

pub use blob::BlobStore;
pub use cache::TtlCache;
pub use graph::{extract_entities, GraphHit, GraphIndex, InMemoryGraph};
pub use keyword::KeywordIndex;
