use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub vision: VisionConfig,
    pub speech: SpeechConfig,
    pub ingestion: IngestionConfig,
    pub retrieval: RetrievalConfig,
    pub chat: ChatConfig,
    pub storage: StorageConfig,
    pub rate_limit: RateLimitConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VisionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SpeechConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub enabled: bool,
    /// Ceiling for a single transcription call, seconds.
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestionConfig {
    pub chunk_size_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub max_video_duration_seconds: u64,
    pub temp_dir: Option<String>,
    pub domain_processors_enabled: bool,
    /// Resume extraction may call the LLM; off means regex-only.
    pub llm_domain_extraction_enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub rrf_k: u32,
    /// "rrf" (default) or "linear".
    pub fusion: String,
    pub linear_alpha: f32,
    pub hierarchical_top_docs: usize,
    pub deadline_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub cache_capacity: usize,
    pub reformulation_enabled: bool,
    pub rerank_enabled: bool,
    pub graph_enabled: bool,
    pub rerank_base_url: Option<String>,
    pub rerank_model: Option<String>,
    pub synonym_dict_path: Option<String>,
    pub synonym_max: usize,
    pub expand_context: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChatConfig {
    pub max_message_chars: usize,
    pub max_top_k: usize,
    pub history_token_budget: usize,
    pub follow_up_count: usize,
    pub deep_max_iterations: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub document_path: String,
    pub url_signing_secret: String,
    pub default_url_expiry_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub chat: String,
    pub retrieval: String,
    pub upload: String,
    pub auth: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    pub embedding_concurrency: usize,
    pub vision_concurrency: usize,
    pub llm_per_user_concurrency: usize,
    pub acquire_timeout_ms: u64,
    pub embedding_batch_size: usize,
    pub ingest_workers: usize,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: 512,
            chunk_overlap_tokens: 64,
            max_video_duration_seconds: 3600,
            temp_dir: None,
            domain_processors_enabled: true,
            llm_domain_extraction_enabled: true,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            rrf_k: 60,
            fusion: "rrf".to_string(),
            linear_alpha: 0.7,
            hierarchical_top_docs: 5,
            deadline_seconds: 10,
            cache_ttl_seconds: 300,
            cache_capacity: 1024,
            reformulation_enabled: false,
            rerank_enabled: false,
            graph_enabled: true,
            rerank_base_url: None,
            rerank_model: None,
            synonym_dict_path: None,
            synonym_max: 5,
            expand_context: false,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 10_000,
            max_top_k: 20,
            history_token_budget: 2000,
            follow_up_count: 3,
            deep_max_iterations: 3,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            embedding_concurrency: 8,
            vision_concurrency: 5,
            llm_per_user_concurrency: 2,
            acquire_timeout_ms: 15_000,
            embedding_batch_size: 16,
            ingest_workers: 2 * num_cpus(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let retrieval = RetrievalConfig::default();
        assert_eq!(retrieval.rrf_k, 60);
        assert_eq!(retrieval.fusion, "rrf");
        assert!(retrieval.hierarchical_top_docs >= 1);

        let chat = ChatConfig::default();
        assert_eq!(chat.max_message_chars, 10_000);
        assert!(chat.deep_max_iterations <= 3);

        let limits = LimitsConfig::default();
        assert!(limits.ingest_workers >= 2);
    }
}
