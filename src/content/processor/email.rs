use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{DomainProcessor, ProcessedDocument};

/// Email thread processor. Trusts the parser's header metadata when present
/// and otherwise looks for header lines in the content.
pub struct EmailProcessor;

#[async_trait]
impl DomainProcessor for EmailProcessor {
    fn name(&self) -> &'static str {
        "email"
    }

    fn can_process(&self, content: &str, metadata: &Map<String, Value>) -> f32 {
        if metadata.contains_key("headers") {
            return 0.95;
        }
        let head: String = content.lines().take(10).collect::<Vec<_>>().join("\n");
        let header_lines = ["From:", "To:", "Subject:", "Date:", "Cc:"]
            .iter()
            .filter(|h| head.contains(**h))
            .count();
        match header_lines {
            0 | 1 => 0.0,
            2 => 0.4,
            _ => 0.8,
        }
    }

    async fn process(
        &self,
        content: &str,
        metadata: &Map<String, Value>,
        _filename: Option<&str>,
    ) -> Result<ProcessedDocument> {
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.8);

        if let Some(headers) = metadata.get("headers") {
            for key in ["from", "to", "subject", "date"] {
                if let Some(value) = headers.get(key) {
                    processed
                        .document_metadata
                        .insert(key.to_string(), value.clone());
                }
            }
            processed
                .document_metadata
                .insert("is_reply".to_string(), json!(headers.get("in-reply-to").is_some()));
        }

        // Quoted reply markers break the thread into turns
        for (offset, _) in content.match_indices("\nOn ") {
            let tail = &content[offset..content.len().min(offset + 200)];
            if tail.contains("wrote:") {
                processed
                    .annotations
                    .push(super::ChunkAnnotation::boundary("reply_quote", offset + 1));
            }
        }

        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_metadata_is_decisive() {
        let mut metadata = Map::new();
        metadata.insert("headers".to_string(), json!({"subject": "hi"}));
        assert!(EmailProcessor.can_process("anything", &metadata) > 0.9);
    }

    #[test]
    fn plain_prose_scores_zero() {
        assert_eq!(
            EmailProcessor.can_process("a story about nothing in particular", &Map::new()),
            0.0
        );
    }

    #[tokio::test]
    async fn reply_quotes_become_boundaries() {
        let content = "Thanks, sounds good.\nOn Mon, Jan 6, Ada wrote:\n> earlier text";
        let processed = EmailProcessor
            .process(content, &Map::new(), None)
            .await
            .unwrap();
        assert!(processed
            .annotations
            .iter()
            .any(|a| a.kind == "reply_quote" && a.preserve_boundary));
    }
}
