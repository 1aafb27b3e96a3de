use crate::config::EmbeddingConfig;
use crate::llm::chat::{ChatMessage, ChatModel, GenerationParams};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Port over the embedding provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Batched embedding; output order matches input order.
    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ApiError>;

    /// Query embedding with the same model as chunk embeddings.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ApiError>;

    /// Document summary plus its embedding, for hierarchical retrieval.
    async fn summarize_and_embed(
        &self,
        document_text: &str,
    ) -> Result<(String, Vec<f32>), ApiError>;

    fn dimension(&self) -> usize;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

const SUMMARY_PROMPT: &str = "Summarize the following document in at most 1000 tokens. \
Focus on the main topics, entities and conclusions so the summary can stand in \
for the document in a relevance search. Output only the summary.";

/// HTTP embedder against an OpenAI-compatible `/v1/embeddings` endpoint.
///
/// Failures are retried with exponential backoff up to the configured ceiling;
/// single-text embeddings are cached.
pub struct HttpEmbedder {
    client: Client,
    config: EmbeddingConfig,
    chat_model: Arc<dyn ChatModel>,
    cache: DashMap<String, Vec<f32>>,
    limiters: Arc<Limiters>,
    batch_size: usize,
}

impl HttpEmbedder {
    pub fn new(
        config: EmbeddingConfig,
        chat_model: Arc<dyn ChatModel>,
        limiters: Arc<Limiters>,
        batch_size: usize,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
            chat_model,
            cache: DashMap::new(),
            limiters,
            batch_size: batch_size.max(1),
        }
    }

    async fn call_api(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
        debug!(wait_ms = wait.as_millis() as u64, op = "embedding", "wait_queue");

        let request = EmbeddingRequest {
            input: texts.to_vec(),
            model: self.config.model.clone(),
        };
        let url = format!("{}/v1/embeddings", self.config.base_url);

        let exec_start = Instant::now();
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to reach embedding server: {}", e)))?;
        debug!(exec_ms = exec_start.elapsed().as_millis() as u64, op = "embedding", "exec");

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "Embedding API error ({}): {}",
                status, body
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to parse embedding response: {}", e)))?;

        if body.data.len() != texts.len() {
            return Err(ApiError::Upstream(format!(
                "Embedding count mismatch: sent {}, got {}",
                texts.len(),
                body.data.len()
            )));
        }

        // The provider may reorder; the index field is authoritative
        let mut ordered: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];
        for item in body.data {
            if item.index >= ordered.len() {
                return Err(ApiError::Upstream(format!(
                    "Embedding index {} out of range",
                    item.index
                )));
            }
            if item.embedding.len() != self.config.dimension {
                return Err(ApiError::Upstream(format!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    self.config.dimension,
                    item.embedding.len()
                )));
            }
            ordered[item.index] = item.embedding;
        }

        Ok(ordered)
    }

    /// One batch with exponential backoff.
    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let mut attempt = 0u32;
        loop {
            match self.call_api(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_delay_ms * 2u64.pow(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay,
                        "embedding call failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ApiError> {
        debug!(
            "Embedding {} texts (batch_size={})",
            texts.len(),
            self.batch_size
        );

        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.call_with_retry(batch).await?;
            results.extend(vectors);
        }
        Ok(results)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        if let Some(cached) = self.cache.get(text) {
            debug!("embedding cache hit");
            return Ok(cached.clone());
        }

        let vectors = self.call_with_retry(&[text.to_string()]).await?;
        let embedding = vectors
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Upstream("Empty embedding batch".to_string()))?;

        self.cache.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn summarize_and_embed(
        &self,
        document_text: &str,
    ) -> Result<(String, Vec<f32>), ApiError> {
        let prompt = format!("{}\n\n{}", SUMMARY_PROMPT, document_text);
        let summary = self
            .chat_model
            .complete(vec![ChatMessage::user(prompt)], &GenerationParams::default())
            .await?;

        let vectors = self.call_with_retry(&[summary.clone()]).await?;
        let embedding = vectors
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Upstream("Empty embedding batch".to_string()))?;

        Ok((summary, embedding))
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}
