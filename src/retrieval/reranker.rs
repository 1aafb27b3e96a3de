use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::models::retrieval::RetrievalResult;
use crate::utils::error::ApiError;

/// Port over the reranking provider. Attaches `rerank_score` in [0, 1] and
/// reorders candidates; used only when enabled in chat retrieval config.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalResult>,
    ) -> Result<Vec<RetrievalResult>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankEntry>,
}

#[derive(Debug, Deserialize)]
struct RerankEntry {
    index: usize,
    relevance_score: f32,
}

/// HTTP reranker against a `/rerank` endpoint (Cohere-compatible shape).
pub struct HttpReranker {
    client: Client,
    base_url: String,
    model: Option<String>,
}

impl HttpReranker {
    pub fn new(base_url: String, model: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url,
            model,
        }
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalResult>,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let documents: Vec<&str> = candidates.iter().map(|c| c.content.as_str()).collect();
        let request = json!({
            "model": self.model,
            "query": query,
            "documents": documents,
        });

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to reach reranker: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ApiError::Upstream(format!("Reranker error: {}", status)));
        }

        let body: RerankResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to parse rerank response: {}", e)))?;

        let mut candidates = candidates;
        let mut reordered = Vec::with_capacity(candidates.len());
        let mut taken = vec![false; candidates.len()];

        for entry in &body.results {
            if entry.index >= candidates.len() || taken[entry.index] {
                continue;
            }
            taken[entry.index] = true;
            let mut candidate = candidates[entry.index].clone();
            candidate.rerank_score = Some(entry.relevance_score.clamp(0.0, 1.0));
            reordered.push(candidate);
        }
        // Anything the provider dropped keeps its old order at the tail
        for (i, candidate) in candidates.drain(..).enumerate() {
            if !taken[i] {
                reordered.push(candidate);
            }
        }

        debug!("reranked {} candidates", reordered.len());
        Ok(reordered)
    }
}
