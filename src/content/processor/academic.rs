use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{keyword_signal, ChunkAnnotation, DomainProcessor, ProcessedDocument};

const SECTION_SIGNALS: &[&str] = &[
    "abstract",
    "introduction",
    "methodology",
    "related work",
    "experiments",
    "conclusion",
    "references",
    "acknowledgments",
];

static DOI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"10\.\d{4,9}/[-._;()/:a-zA-Z0-9]+").expect("static regex"));
static CITATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d{1,3}\]").expect("static regex"));

/// Academic paper processor: section headers, DOI, bracketed citations.
pub struct AcademicProcessor;

#[async_trait]
impl DomainProcessor for AcademicProcessor {
    fn name(&self) -> &'static str {
        "academic"
    }

    fn can_process(&self, content: &str, _metadata: &Map<String, Value>) -> f32 {
        let lower = content.to_lowercase();
        let mut score = keyword_signal(&lower, SECTION_SIGNALS, 4);
        if DOI.is_match(content) {
            score += 0.2;
        }
        if CITATION.find_iter(content).count() >= 5 {
            score += 0.2;
        }
        score.min(0.95)
    }

    async fn process(
        &self,
        content: &str,
        _metadata: &Map<String, Value>,
        _filename: Option<&str>,
    ) -> Result<ProcessedDocument> {
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.7);

        if let Some(doi) = DOI.find(content) {
            processed
                .document_metadata
                .insert("doi".to_string(), json!(doi.as_str()));
        }
        processed.document_metadata.insert(
            "citation_count".to_string(),
            json!(CITATION.find_iter(content).count()),
        );
        processed
            .document_metadata
            .insert("document_kind".to_string(), json!("academic"));

        // Abstract, if present, should stay one chunk
        let lower = content.to_lowercase();
        if let Some(start) = lower.find("abstract") {
            processed
                .annotations
                .push(ChunkAnnotation::new("section", json!("abstract")));
            if start > 0 {
                processed
                    .annotations
                    .push(ChunkAnnotation::boundary("section_start", start));
            }
        }
        if let Some(start) = lower.find("references") {
            // References are low-value for retrieval; tag them
            processed
                .annotations
                .push(ChunkAnnotation::boundary("references_start", start));
        }

        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAPER: &str = "Abstract\nWe present a study.\n\nIntroduction\nPrior work [1] [2] \
[3] [4] [5] showed results.\n\nReferences\n[1] Some Paper. doi:10.1145/3292500.3330701";

    #[test]
    fn papers_score_above_threshold() {
        assert!(AcademicProcessor.can_process(PAPER, &Map::new()) >= 0.3);
    }

    #[tokio::test]
    async fn doi_and_sections_are_extracted() {
        let processed = AcademicProcessor.process(PAPER, &Map::new(), None).await.unwrap();
        assert_eq!(
            processed.document_metadata["doi"],
            "10.1145/3292500.3330701"
        );
        assert!(processed
            .annotations
            .iter()
            .any(|a| a.kind == "references_start"));
    }
}
