use std::sync::Arc;

use crate::chat::ChatOrchestrator;
use crate::config::Settings;
use crate::database::{DbPool, Repository};
use crate::index::{BlobStore, GraphIndex, KeywordIndex, TtlCache};
use crate::ingest::IngestionCoordinator;
use crate::llm::ChatModel;
use crate::retrieval::{QueryReformulator, RetrievalEngine, SynonymService};
use crate::utils::limiters::Limiters;
use crate::utils::rate_limit::ApiRateLimiter;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub db_pool: DbPool,
    pub repository: Arc<Repository>,
    pub blob_store: Arc<BlobStore>,
    pub keyword_index: Arc<KeywordIndex>,
    pub graph_index: Arc<dyn GraphIndex>,
    pub cache: Arc<TtlCache>,
    pub synonyms: Arc<SynonymService>,
    pub chat_model: Arc<dyn ChatModel>,
    pub engine: Arc<RetrievalEngine>,
    pub reformulator: Arc<QueryReformulator>,
    pub coordinator: Arc<IngestionCoordinator>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub rate_limiter: Arc<ApiRateLimiter>,
    pub limiters: Arc<Limiters>,
}
