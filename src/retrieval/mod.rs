pub mod engine;
pub mod fusion;
pub mod reformulator;
pub mod reranker;
pub mod synonym;

pub use engine::RetrievalEngine;
pub use reformulator::{QueryReformulator, Reformulated, ReformulationMode};
pub use reranker::{HttpReranker, Reranker};
pub use synonym::SynonymService;
