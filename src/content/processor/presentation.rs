use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{ChunkAnnotation, DomainProcessor, ProcessedDocument};

/// Slide deck processor: keeps slides whole and records the deck shape.
pub struct PresentationProcessor;

#[async_trait]
impl DomainProcessor for PresentationProcessor {
    fn name(&self) -> &'static str {
        "presentation"
    }

    fn can_process(&self, content: &str, metadata: &Map<String, Value>) -> f32 {
        if metadata.contains_key("slides") {
            return 0.95;
        }
        let slide_markers = content.matches("## Slide ").count();
        if slide_markers >= 2 {
            0.7
        } else {
            0.0
        }
    }

    async fn process(
        &self,
        content: &str,
        metadata: &Map<String, Value>,
        _filename: Option<&str>,
    ) -> Result<ProcessedDocument> {
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.9);

        let mut slide_count = 0usize;
        for (offset, _) in content.match_indices("## Slide ") {
            slide_count += 1;
            // Never merge chunks across a slide break
            if offset > 0 {
                processed
                    .annotations
                    .push(ChunkAnnotation::boundary("slide_break", offset));
            }
        }

        let slides = metadata
            .get("slides")
            .and_then(|s| s.as_u64())
            .unwrap_or(slide_count as u64);
        processed
            .document_metadata
            .insert("slide_count".to_string(), json!(slides));

        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slide_breaks_become_boundaries() {
        let content = "## Slide 1\n\nIntro\n\n## Slide 2\n\nDetails\n\n## Slide 3\n\nEnd";
        assert!(PresentationProcessor.can_process(content, &Map::new()) > 0.3);

        let processed = PresentationProcessor
            .process(content, &Map::new(), None)
            .await
            .unwrap();
        let boundaries = processed.hard_boundaries();
        assert_eq!(boundaries.len(), 2);
        assert_eq!(processed.document_metadata["slide_count"], 3);
    }
}
