use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::utils::ApiError;

pub const MAX_QUERY_CHARS: usize = 2000;
pub const MAX_TOP_K: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Semantic,
    Keyword,
    Hybrid,
    Hierarchical,
    Graph,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Semantic => "semantic",
            RetrievalMode::Keyword => "keyword",
            RetrievalMode::Hybrid => "hybrid",
            RetrievalMode::Hierarchical => "hierarchical",
            RetrievalMode::Graph => "graph",
        }
    }
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    pub collection_id: Option<Uuid>,
    pub metadata_filter: Option<Value>,
}

impl RetrievalRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        let trimmed = self.query.trim();
        if trimmed.is_empty() {
            return Err(ApiError::invalid_field("query", "must not be empty"));
        }
        if self.query.chars().count() > MAX_QUERY_CHARS {
            return Err(ApiError::invalid_field(
                "query",
                format!("must be at most {} characters", MAX_QUERY_CHARS),
            ));
        }
        Ok(())
    }

    /// top_k clamped to the documented window.
    pub fn effective_top_k(&self) -> usize {
        self.top_k.clamp(1, MAX_TOP_K)
    }
}

/// Lightweight reference to the owning document, embedded in each result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: Uuid,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: Uuid,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_content: Option<String>,
    pub chunk_index: i32,
    pub score: f32,
    /// Domain-processor annotations attached at ingestion.
    pub metadata: Value,
    /// Positional chunk metadata (page, section, media refs).
    pub chunk_metadata: Value,
    pub document: DocumentRef,
    pub collection_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct RetrievalResponse {
    pub query: String,
    pub mode: RetrievalMode,
    pub results: Vec<RetrievalResult>,
    pub total_results: usize,
    pub processing_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(query: &str, top_k: usize) -> RetrievalRequest {
        RetrievalRequest {
            query: query.to_string(),
            mode: RetrievalMode::Hybrid,
            top_k,
            collection_id: None,
            metadata_filter: None,
        }
    }

    #[test]
    fn top_k_is_clamped() {
        assert_eq!(request("q", 0).effective_top_k(), 1);
        assert_eq!(request("q", 10).effective_top_k(), 10);
        assert_eq!(request("q", 500).effective_top_k(), 50);
    }

    #[test]
    fn query_length_is_enforced() {
        assert!(request("", 5).validate().is_err());
        assert!(request(&"x".repeat(2001), 5).validate().is_err());
        assert!(request(&"x".repeat(2000), 5).validate().is_ok());
    }

    #[test]
    fn mode_deserializes_lowercase() {
        let req: RetrievalRequest =
            serde_json::from_str(r#"{"query": "q", "mode": "hierarchical"}"#).unwrap();
        assert_eq!(req.mode, RetrievalMode::Hierarchical);
        assert_eq!(req.top_k, 10);
    }
}
