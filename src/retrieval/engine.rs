//! The hybrid retrieval engine: five modes behind one request contract.

use pgvector::Vector;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::database::{Repository, ScoredChunkRow};
use crate::index::{extract_entities, GraphIndex, KeywordIndex, TtlCache};
use crate::llm::Embedder;
use crate::models::retrieval::{
    DocumentRef, RetrievalMode, RetrievalRequest, RetrievalResponse, RetrievalResult,
};
use crate::retrieval::fusion;
use crate::retrieval::synonym::SynonymService;
use crate::utils::error::ApiError;

pub struct RetrievalEngine {
    repository: Arc<Repository>,
    embedder: Arc<dyn Embedder>,
    keyword_index: Arc<KeywordIndex>,
    graph_index: Arc<dyn GraphIndex>,
    cache: Arc<TtlCache>,
    synonyms: Arc<SynonymService>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        repository: Arc<Repository>,
        embedder: Arc<dyn Embedder>,
        keyword_index: Arc<KeywordIndex>,
        graph_index: Arc<dyn GraphIndex>,
        cache: Arc<TtlCache>,
        synonyms: Arc<SynonymService>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            repository,
            embedder,
            keyword_index,
            graph_index,
            cache,
            synonyms,
            config,
        }
    }

    /// Entry point: validate, consult the cache, run the mode under the soft
    /// deadline, sort and truncate. `processing_time_ms` covers exactly this
    /// boundary; rerank and prompt assembly are outside it.
    pub async fn retrieve(
        &self,
        user_id: Uuid,
        request: &RetrievalRequest,
    ) -> Result<RetrievalResponse, ApiError> {
        request.validate()?;
        let top_k = request.effective_top_k();
        let started = Instant::now();

        let fingerprint = TtlCache::retrieval_fingerprint(
            request.mode.as_str(),
            &request.query,
            request.collection_id,
            request.metadata_filter.as_ref(),
            top_k,
        );
        if let Some(cached) = self.cache.get(&fingerprint) {
            if let Ok(results) = serde_json::from_str::<Vec<RetrievalResult>>(&cached) {
                debug!("retrieval cache hit");
                let total_results = results.len();
                return Ok(RetrievalResponse {
                    query: request.query.clone(),
                    mode: request.mode,
                    results,
                    total_results,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        let deadline = Duration::from_secs(self.config.deadline_seconds.max(1));
        let dispatched = self.dispatch(user_id, request, top_k);
        let mut results = match tokio::time::timeout(deadline, dispatched).await {
            Ok(results) => results?,
            Err(_) => {
                warn!(mode = request.mode.as_str(), "retrieval deadline exceeded");
                return Err(ApiError::Timeout(format!(
                    "retrieval exceeded the {}s deadline",
                    deadline.as_secs()
                )));
            }
        };

        sort_results(&mut results);
        results.truncate(top_k);

        if self.config.expand_context {
            self.expand_context(&mut results).await;
        }

        if let Ok(serialized) = serde_json::to_string(&results) {
            self.cache.set(fingerprint, serialized);
        }

        let total_results = results.len();
        info!(
            mode = request.mode.as_str(),
            total_results,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retrieval complete"
        );

        Ok(RetrievalResponse {
            query: request.query.clone(),
            mode: request.mode,
            results,
            total_results,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn dispatch(
        &self,
        user_id: Uuid,
        request: &RetrievalRequest,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        match request.mode {
            RetrievalMode::Semantic => self.semantic(user_id, request, top_k).await,
            RetrievalMode::Keyword => self.keyword(user_id, request, top_k).await,
            RetrievalMode::Hybrid => self.hybrid(user_id, request, top_k).await,
            RetrievalMode::Hierarchical => self.hierarchical(user_id, request, top_k).await,
            RetrievalMode::Graph => self.graph(user_id, request, top_k).await,
        }
    }

    async fn embed_query(&self, query: &str) -> Result<Vector, ApiError> {
        let embedding = self.embedder.embed_query(query).await?;
        Ok(Vector::from(embedding))
    }

    async fn semantic(
        &self,
        user_id: Uuid,
        request: &RetrievalRequest,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        let query_embedding = self.embed_query(&request.query).await?;
        let rows = self
            .repository
            .vector_search_chunks(
                user_id,
                query_embedding,
                request.collection_id,
                None,
                request.metadata_filter.as_ref(),
                top_k as i64,
            )
            .await?;
        Ok(rows.into_iter().map(row_to_result).collect())
    }

    async fn keyword(
        &self,
        user_id: Uuid,
        request: &RetrievalRequest,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        // Synonyms widen recall on the lexical side
        let query = self.synonyms.expand_query(&request.query, 3);
        // Over-fetch so metadata filtering cannot starve the page
        let hits = self
            .keyword_index
            .search(request.collection_id, &query, top_k * 4);
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let normalized = fusion::min_max_normalize(&hits);
        let ids: Vec<Uuid> = normalized.iter().map(|(id, _)| *id).collect();
        let rows = self.repository.get_chunks_by_ids(user_id, &ids).await?;

        let mut results = hydrate_scored(rows, &normalized);
        apply_metadata_filter(&mut results, request.metadata_filter.as_ref());
        results.truncate(top_k);
        Ok(results)
    }

    async fn hybrid(
        &self,
        user_id: Uuid,
        request: &RetrievalRequest,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        let (semantic, keyword) = futures::join!(
            self.semantic(user_id, request, top_k * 2),
            self.keyword(user_id, request, top_k * 2)
        );
        let semantic = semantic?;
        let keyword = keyword?;

        let fused: Vec<(Uuid, f32)> = if self.config.fusion == "linear" {
            let semantic_scores: Vec<(Uuid, f32)> =
                semantic.iter().map(|r| (r.chunk_id, r.score)).collect();
            let keyword_scores: Vec<(Uuid, f32)> =
                keyword.iter().map(|r| (r.chunk_id, r.score)).collect();
            fusion::linear_fusion(&semantic_scores, &keyword_scores, self.config.linear_alpha)
        } else {
            let semantic_ranked: Vec<Uuid> = semantic.iter().map(|r| r.chunk_id).collect();
            let keyword_ranked: Vec<Uuid> = keyword.iter().map(|r| r.chunk_id).collect();
            fusion::reciprocal_rank_fusion(&[semantic_ranked, keyword_ranked], self.config.rrf_k)
        };

        // De-duplicate on chunk_id, keeping the higher-scoring hydration
        let mut by_id: std::collections::HashMap<Uuid, RetrievalResult> =
            std::collections::HashMap::new();
        for result in semantic.into_iter().chain(keyword) {
            by_id
                .entry(result.chunk_id)
                .and_modify(|existing| {
                    if result.score > existing.score {
                        *existing = result.clone();
                    }
                })
                .or_insert(result);
        }

        let mut results: Vec<RetrievalResult> = fused
            .into_iter()
            .filter_map(|(chunk_id, score)| {
                by_id.remove(&chunk_id).map(|mut result| {
                    result.score = score;
                    result
                })
            })
            .collect();
        results.truncate(top_k);
        Ok(results)
    }

    /// Two stages: document-summary vectors pick the top documents, then a
    /// chunk search runs restricted to them. Falls back to plain semantic
    /// when no summaries exist yet.
    async fn hierarchical(
        &self,
        user_id: Uuid,
        request: &RetrievalRequest,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        let query_embedding = self.embed_query(&request.query).await?;
        let top_docs = self
            .config
            .hierarchical_top_docs
            .max(top_k.div_ceil(2))
            .max(1);

        let document_hits = self
            .repository
            .search_document_summaries(
                user_id,
                query_embedding.clone(),
                request.collection_id,
                top_docs as i64,
            )
            .await?;

        if document_hits.is_empty() {
            debug!("no document summaries, falling back to semantic");
            return self.semantic(user_id, request, top_k).await;
        }

        let document_ids: Vec<Uuid> = document_hits.iter().map(|h| h.document_id).collect();
        let rows = self
            .repository
            .vector_search_chunks(
                user_id,
                query_embedding,
                request.collection_id,
                Some(document_ids.as_slice()),
                request.metadata_filter.as_ref(),
                top_k as i64,
            )
            .await?;
        Ok(rows.into_iter().map(row_to_result).collect())
    }

    async fn graph(
        &self,
        user_id: Uuid,
        request: &RetrievalRequest,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        if !self.config.graph_enabled {
            return Err(ApiError::Validation(
                "graph retrieval is disabled".to_string(),
            ));
        }

        let entities = extract_entities(&request.query);
        let hits = self
            .graph_index
            .neighbors(request.collection_id, entities, top_k * 4)
            .await;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        // Re-score by node relevance, normalized to [0, 1]
        let scored: Vec<(Uuid, f32)> = hits.iter().map(|h| (h.chunk_id, h.relevance)).collect();
        let normalized = fusion::min_max_normalize(&scored);

        let ids: Vec<Uuid> = normalized.iter().map(|(id, _)| *id).collect();
        let rows = self.repository.get_chunks_by_ids(user_id, &ids).await?;

        let mut results = hydrate_scored(rows, &normalized);
        apply_metadata_filter(&mut results, request.metadata_filter.as_ref());
        results.truncate(top_k);
        Ok(results)
    }

    /// Enrich each result with its ±1 neighbors as `expanded_content`.
    pub async fn expand_context(&self, results: &mut [RetrievalResult]) {
        for result in results.iter_mut() {
            match self
                .repository
                .get_neighbor_chunks(result.document.id, result.chunk_index)
                .await
            {
                Ok(neighbors) if neighbors.len() > 1 => {
                    let expanded = neighbors
                        .iter()
                        .map(|c| c.content.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    result.expanded_content = Some(expanded);
                }
                Ok(_) => {}
                Err(e) => warn!("context expansion failed: {}", e),
            }
        }
    }
}

/// Strict ordering: score descending, ties by (chunk_index, document_id).
pub fn sort_results(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
}

fn row_to_result(row: ScoredChunkRow) -> RetrievalResult {
    RetrievalResult {
        chunk_id: row.chunk_id,
        content: row.content,
        expanded_content: None,
        chunk_index: row.chunk_index,
        score: (row.score as f32).clamp(0.0, 1.0),
        metadata: row.annotations,
        chunk_metadata: row.metadata,
        document: DocumentRef {
            id: row.document_id,
            title: row.document_title,
            filename: row.document_filename,
            metadata: row.document_metadata,
        },
        collection_id: row.collection_id,
        rerank_score: None,
    }
}

/// Hydrated rows come back unscored and unordered; attach the given scores
/// and order by them.
fn hydrate_scored(rows: Vec<ScoredChunkRow>, scores: &[(Uuid, f32)]) -> Vec<RetrievalResult> {
    let by_id: std::collections::HashMap<Uuid, ScoredChunkRow> =
        rows.into_iter().map(|r| (r.chunk_id, r)).collect();

    let mut results = Vec::new();
    for (chunk_id, score) in scores {
        if let Some(row) = by_id.get(chunk_id) {
            let mut result = row_to_result(row.clone());
            result.score = score.clamp(0.0, 1.0);
            results.push(result);
        }
    }
    results
}

/// JSONB-style containment check: every key/value in `needle` must appear in
/// the result's chunk or document metadata.
fn apply_metadata_filter(results: &mut Vec<RetrievalResult>, filter: Option<&Value>) {
    let Some(filter) = filter else { return };
    results.retain(|r| {
        value_contains(&r.chunk_metadata, filter) || value_contains(&r.document.metadata, filter)
    });
}

fn value_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(h), Value::Object(n)) => n
            .iter()
            .all(|(key, value)| h.get(key).is_some_and(|hv| value_contains(hv, value))),
        (Value::Array(h), Value::Array(n)) => {
            n.iter().all(|nv| h.iter().any(|hv| value_contains(hv, nv)))
        }
        (h, n) => h == n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(score: f32, chunk_index: i32, document_id: Uuid) -> RetrievalResult {
        RetrievalResult {
            chunk_id: Uuid::new_v4(),
            content: "c".to_string(),
            expanded_content: None,
            chunk_index,
            score,
            metadata: json!([]),
            chunk_metadata: json!({}),
            document: DocumentRef {
                id: document_id,
                title: None,
                filename: None,
                metadata: json!({}),
            },
            collection_id: Uuid::new_v4(),
            rerank_score: None,
        }
    }

    #[test]
    fn sorting_is_score_then_chunk_index_then_document() {
        let doc_a = Uuid::from_u128(1);
        let doc_b = Uuid::from_u128(2);
        let mut results = vec![
            result(0.5, 3, doc_a),
            result(0.9, 7, doc_b),
            result(0.5, 1, doc_b),
            result(0.5, 1, doc_a),
        ];
        sort_results(&mut results);

        assert_eq!(results[0].score, 0.9);
        // Tied scores: chunk_index 1 before 3; same index: doc_a before doc_b
        assert_eq!(results[1].chunk_index, 1);
        assert_eq!(results[1].document.id, doc_a);
        assert_eq!(results[2].chunk_index, 1);
        assert_eq!(results[2].document.id, doc_b);
        assert_eq!(results[3].chunk_index, 3);
    }

    #[test]
    fn metadata_filter_is_containment() {
        let mut a = result(0.9, 0, Uuid::new_v4());
        a.chunk_metadata = json!({"lang": "en", "page": 3});
        let mut b = result(0.8, 1, Uuid::new_v4());
        b.chunk_metadata = json!({"lang": "de"});
        let mut c = result(0.7, 2, Uuid::new_v4());
        c.document.metadata = json!({"lang": "en"});

        let mut results = vec![a, b, c];
        apply_metadata_filter(&mut results, Some(&json!({"lang": "en"})));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.score != 0.8));
    }

    #[test]
    fn containment_handles_nesting_and_arrays() {
        let haystack = json!({"tags": ["a", "b"], "info": {"kind": "x", "extra": 1}});
        assert!(value_contains(&haystack, &json!({"tags": ["a"]})));
        assert!(value_contains(&haystack, &json!({"info": {"kind": "x"}})));
        assert!(!value_contains(&haystack, &json!({"tags": ["z"]})));
        assert!(!value_contains(&haystack, &json!({"info": {"kind": "y"}})));
    }

    #[test]
    fn hydrate_preserves_given_score_order() {
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let row = |id: Uuid| ScoredChunkRow {
            chunk_id: id,
            document_id: Uuid::new_v4(),
            collection_id: Uuid::new_v4(),
            chunk_index: 0,
            content: "x".to_string(),
            token_count: 1,
            metadata: json!({}),
            annotations: json!([]),
            score: 0.0,
            document_title: None,
            document_filename: None,
            document_metadata: json!({}),
        };
        let results = hydrate_scored(vec![row(id_a), row(id_b)], &[(id_b, 0.9), (id_a, 0.4)]);
        assert_eq!(results[0].chunk_id, id_b);
        assert!((results[0].score - 0.9).abs() < 1e-6);
        assert_eq!(results[1].chunk_id, id_a);
    }
}
