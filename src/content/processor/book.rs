use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{ChunkAnnotation, DomainProcessor, ProcessedDocument};

static CHAPTER_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^\s*(chapter\s+[\dIVXLC]+|part\s+[\dIVXLC]+)\b").expect("static regex")
});

/// Long-form book processor: chapter structure drives the boundaries.
pub struct BookProcessor;

#[async_trait]
impl DomainProcessor for BookProcessor {
    fn name(&self) -> &'static str {
        "book"
    }

    fn can_process(&self, content: &str, _metadata: &Map<String, Value>) -> f32 {
        let chapters = CHAPTER_HEAD.find_iter(content).count();
        let words = content.split_whitespace().count();
        if chapters >= 3 && words > 5000 {
            0.8
        } else if chapters >= 2 {
            0.4
        } else {
            0.0
        }
    }

    async fn process(
        &self,
        content: &str,
        _metadata: &Map<String, Value>,
        _filename: Option<&str>,
    ) -> Result<ProcessedDocument> {
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.6);

        let mut chapters = Vec::new();
        for m in CHAPTER_HEAD.find_iter(content) {
            chapters.push(m.as_str().trim().to_string());
            if m.start() > 0 {
                processed
                    .annotations
                    .push(ChunkAnnotation::boundary("chapter", m.start()));
            }
        }

        processed
            .document_metadata
            .insert("chapter_count".to_string(), json!(chapters.len()));
        processed
            .document_metadata
            .insert("chapters".to_string(), json!(chapters));
        processed
            .document_metadata
            .insert("document_kind".to_string(), json!("book"));
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chapters_become_boundaries() {
        let content = "Chapter 1\nIt begins.\nChapter 2\nIt continues.\nChapter 3\nIt ends.";
        let processed = BookProcessor.process(content, &Map::new(), None).await.unwrap();
        assert_eq!(processed.document_metadata["chapter_count"], 3);
        assert_eq!(processed.hard_boundaries().len(), 2);
    }

    #[test]
    fn short_unstructured_text_scores_zero() {
        assert_eq!(BookProcessor.can_process("a note", &Map::new()), 0.0);
    }
}
