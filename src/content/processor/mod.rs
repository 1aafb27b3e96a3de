//! Domain classification: detect what kind of document this is and attach
//! kind-specific metadata plus chunk annotations.
//!
//! Selection runs `can_process` across the fixed processor set and picks the
//! highest confidence at or above the threshold; ties resolve by the fixed
//! priority order of the registry, and anything below threshold falls back
//! to `general`.

pub mod academic;
pub mod book;
pub mod email;
pub mod general;
pub mod legal;
pub mod manual;
pub mod presentation;
pub mod qa;
pub mod resume;
pub mod table;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::llm::ChatModel;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;

/// An annotation attached to a span of the processed content. A
/// `preserve_boundary` annotation forbids the chunker from merging across
/// its `start` offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAnnotation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub preserve_boundary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
}

impl ChunkAnnotation {
    pub fn new(kind: &str, value: Value) -> Self {
        Self {
            kind: kind.to_string(),
            value,
            preserve_boundary: false,
            start: None,
        }
    }

    pub fn boundary(kind: &str, start: usize) -> Self {
        Self {
            kind: kind.to_string(),
            value: Value::Null,
            preserve_boundary: true,
            start: Some(start),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub content: String,
    pub document_metadata: Map<String, Value>,
    pub annotations: Vec<ChunkAnnotation>,
    pub processor_name: &'static str,
    pub confidence: f32,
}

impl ProcessedDocument {
    pub fn passthrough(content: &str, processor_name: &'static str, confidence: f32) -> Self {
        Self {
            content: content.to_string(),
            document_metadata: Map::new(),
            annotations: Vec::new(),
            processor_name,
            confidence,
        }
    }

    /// Byte offsets the chunker must not merge across.
    pub fn hard_boundaries(&self) -> Vec<usize> {
        self.annotations
            .iter()
            .filter(|a| a.preserve_boundary)
            .filter_map(|a| a.start)
            .collect()
    }
}

#[async_trait]
pub trait DomainProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Confidence in [0, 1] that this processor should own the document.
    fn can_process(&self, content: &str, metadata: &Map<String, Value>) -> f32;

    async fn process(
        &self,
        content: &str,
        metadata: &Map<String, Value>,
        filename: Option<&str>,
    ) -> Result<ProcessedDocument>;
}

/// Fixed processor registry; the vector order is the tie-break priority.
pub struct ProcessorFactory {
    processors: Vec<Arc<dyn DomainProcessor>>,
    general: Arc<dyn DomainProcessor>,
    threshold: f32,
}

impl ProcessorFactory {
    pub fn new(chat_model: Arc<dyn ChatModel>, llm_extraction_enabled: bool) -> Self {
        let processors: Vec<Arc<dyn DomainProcessor>> = vec![
            Arc::new(resume::ResumeProcessor::new(
                chat_model,
                llm_extraction_enabled,
            )),
            Arc::new(email::EmailProcessor),
            Arc::new(presentation::PresentationProcessor),
            Arc::new(qa::QaProcessor),
            Arc::new(table::TableProcessor),
            Arc::new(academic::AcademicProcessor),
            Arc::new(legal::LegalProcessor),
            Arc::new(manual::ManualProcessor),
            Arc::new(book::BookProcessor),
        ];
        Self {
            processors,
            general: Arc::new(general::GeneralProcessor),
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.processors.iter().map(|p| p.name()).collect();
        names.push(self.general.name());
        names
    }

    /// Pick the owning processor for a document.
    pub fn select(
        &self,
        content: &str,
        metadata: &Map<String, Value>,
    ) -> (Arc<dyn DomainProcessor>, f32) {
        let mut best: Option<(Arc<dyn DomainProcessor>, f32)> = None;

        for processor in &self.processors {
            let confidence = processor.can_process(content, metadata).clamp(0.0, 1.0);
            debug!(processor = processor.name(), confidence, "can_process");
            if confidence < self.threshold {
                continue;
            }
            // Strict > keeps the earlier (higher-priority) processor on ties
            let better = match &best {
                Some((_, best_confidence)) => confidence > *best_confidence,
                None => true,
            };
            if better {
                best = Some((processor.clone(), confidence));
            }
        }

        best.unwrap_or_else(|| (self.general.clone(), 0.0))
    }
}

/// Shared helper: fraction of `signals` that occur in the lowercased text,
/// scaled so a handful of hits saturates the score.
pub(crate) fn keyword_signal(text_lower: &str, signals: &[&str], saturation: usize) -> f32 {
    let hits = signals
        .iter()
        .filter(|signal| text_lower.contains(*signal))
        .count();
    (hits as f32 / saturation.max(1) as f32).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::MockChatModel;

    fn factory() -> ProcessorFactory {
        ProcessorFactory::new(Arc::new(MockChatModel::new()), false)
    }

    #[test]
    fn factory_exposes_the_fixed_processor_set() {
        let names = factory().names();
        for expected in [
            "resume",
            "email",
            "presentation",
            "qa",
            "table",
            "academic",
            "legal",
            "manual",
            "book",
            "general",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
    }

    #[test]
    fn below_threshold_falls_back_to_general() {
        let (processor, confidence) =
            factory().select("completely nondescript text about nothing", &Map::new());
        assert_eq!(processor.name(), "general");
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn qa_document_routes_to_qa_processor() {
        let content = "Q: What is RAID?\nA: Redundant array of disks.\n\
                       Q: What is a WAL?\nA: Write-ahead log.\n\
                       Q: What is LSM?\nA: Log-structured merge tree.";
        let (processor, confidence) = factory().select(content, &Map::new());
        assert_eq!(processor.name(), "qa");
        assert!(confidence >= DEFAULT_CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn boundary_annotations_surface_offsets() {
        let doc = ProcessedDocument {
            content: "ab".to_string(),
            document_metadata: Map::new(),
            annotations: vec![
                ChunkAnnotation::boundary("qa_pair", 10),
                ChunkAnnotation::new("topic", serde_json::json!("storage")),
            ],
            processor_name: "qa",
            confidence: 0.8,
        };
        assert_eq!(doc.hard_boundaries(), vec![10]);
    }
}
