use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{keyword_signal, ChunkAnnotation, DomainProcessor, ProcessedDocument};

const LEGAL_SIGNALS: &[&str] = &[
    "whereas",
    "hereinafter",
    "hereby",
    "notwithstanding",
    "indemnif",
    "governing law",
    "terms and conditions",
    "this agreement",
    "the parties",
    "pursuant to",
];

static CLAUSE_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(§\s*\d+|Article\s+[IVXLC\d]+|Section\s+\d+(\.\d+)*)").expect("static regex")
});

/// Contract / statute processor. Clause heads become chunk boundaries so a
/// clause is never split from its number.
pub struct LegalProcessor;

#[async_trait]
impl DomainProcessor for LegalProcessor {
    fn name(&self) -> &'static str {
        "legal"
    }

    fn can_process(&self, content: &str, _metadata: &Map<String, Value>) -> f32 {
        let lower = content.to_lowercase();
        let mut score = keyword_signal(&lower, LEGAL_SIGNALS, 3);
        if CLAUSE_HEAD.find_iter(content).count() >= 3 {
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

        let mut clauses = Vec::new();
        for m in CLAUSE_HEAD.find_iter(content) {
            clauses.push(m.as_str().trim().to_string());
            if m.start() > 0 {
                processed
                    .annotations
                    .push(ChunkAnnotation::boundary("clause", m.start()));
            }
        }

        processed
            .document_metadata
            .insert("clause_count".to_string(), json!(clauses.len()));
        processed
            .document_metadata
            .insert("clauses".to_string(), json!(clauses));
        processed
            .document_metadata
            .insert("document_kind".to_string(), json!("legal"));
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = "This Agreement is made between the parties.\n\
Section 1. Definitions\nWhereas the parties agree...\n\
Section 2. Term\nPursuant to the above...\n\
Section 3. Governing Law\nNotwithstanding anything herein...";

    #[test]
    fn contracts_score_above_threshold() {
        assert!(LegalProcessor.can_process(CONTRACT, &Map::new()) >= 0.3);
    }

    #[tokio::test]
    async fn clause_heads_become_boundaries() {
        let processed = LegalProcessor.process(CONTRACT, &Map::new(), None).await.unwrap();
        assert_eq!(processed.document_metadata["clause_count"], 3);
        // Section 1 is mid-document, so all three get boundaries
        assert_eq!(processed.hard_boundaries().len(), 3);
    }
}
