use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{DomainProcessor, ProcessedDocument};

/// Fallback processor: passthrough content plus basic shape statistics.
pub struct GeneralProcessor;

#[async_trait]
impl DomainProcessor for GeneralProcessor {
    fn name(&self) -> &'static str {
        "general"
    }

    fn can_process(&self, _content: &str, _metadata: &Map<String, Value>) -> f32 {
        // Never competes; the factory uses it only as the fallback
        0.0
    }

    async fn process(
        &self,
        content: &str,
        _metadata: &Map<String, Value>,
        _filename: Option<&str>,
    ) -> Result<ProcessedDocument> {
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.0);
        processed.document_metadata.insert(
            "word_count".to_string(),
            json!(content.split_whitespace().count()),
        );
        processed
            .document_metadata
            .insert("line_count".to_string(), json!(content.lines().count()));
        Ok(processed)
    }
}
