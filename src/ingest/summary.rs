use pgvector::Vector;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::Repository;
use crate::llm::Embedder;

/// Character budget fed to the summarizer; roughly double the summary's
/// token ceiling so short documents pass through whole.
const SUMMARY_INPUT_CHARS: usize = 24_000;

/// Produces and persists the document-level summary and its embedding,
/// which make a document eligible for hierarchical retrieval.
///
/// Failure here is never fatal: the document simply stays absent from
/// hierarchical results while semantic and keyword search keep working.
pub struct DocumentSummaryService {
    repository: Arc<Repository>,
    embedder: Arc<dyn Embedder>,
}

impl DocumentSummaryService {
    pub fn new(repository: Arc<Repository>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            repository,
            embedder,
        }
    }

    /// Summarize and store with an update-if-null compare-and-set, so
    /// concurrent reprocessors never clobber each other.
    pub async fn generate(&self, document_id: Uuid, document_text: &str) {
        let input: String = document_text.chars().take(SUMMARY_INPUT_CHARS).collect();
        if input.trim().is_empty() {
            return;
        }

        let (summary, embedding) = match self.embedder.summarize_and_embed(&input).await {
            Ok(result) => result,
            Err(e) => {
                warn!("summary generation failed for document {}: {}", document_id, e);
                return;
            }
        };

        match self
            .repository
            .set_document_summary_if_absent(document_id, &summary, Vector::from(embedding))
            .await
        {
            Ok(true) => debug!("stored summary for document {}", document_id),
            Ok(false) => debug!("document {} already has a summary", document_id),
            Err(e) => warn!("failed to store summary for document {}: {}", document_id, e),
        }
    }
}
