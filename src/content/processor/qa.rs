use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{ChunkAnnotation, DomainProcessor, ProcessedDocument};

static QUESTION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(Q[:.)\d]|Question\s*[:\d])").expect("static regex"));
static ANSWER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(A[:.)\d]|Answer\s*[:\d])").expect("static regex"));

/// FAQ / Q&A processor. Each question starts a new pair that the chunker
/// must keep intact.
pub struct QaProcessor;

#[async_trait]
impl DomainProcessor for QaProcessor {
    fn name(&self) -> &'static str {
        "qa"
    }

    fn can_process(&self, content: &str, _metadata: &Map<String, Value>) -> f32 {
        let questions = QUESTION_LINE.find_iter(content).count();
        let answers = ANSWER_LINE.find_iter(content).count();
        if questions >= 2 && answers >= 2 {
            // Balanced pairs are a strong signal
            let balance = (answers.min(questions) as f32) / (questions.max(answers) as f32);
            (0.5 + 0.4 * balance).min(0.9)
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
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.8);

        let mut pairs = 0usize;
        for m in QUESTION_LINE.find_iter(content) {
            pairs += 1;
            if m.start() > 0 {
                processed
                    .annotations
                    .push(ChunkAnnotation::boundary("qa_pair", m.start()));
            }
        }

        processed
            .document_metadata
            .insert("qa_pair_count".to_string(), json!(pairs));
        processed
            .document_metadata
            .insert("document_kind".to_string(), json!("qa"));
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAQ: &str = "Q: How do I reset my password?\nA: Use the account page.\n\
Q: How do I export data?\nA: Settings, then export.\n";

    #[test]
    fn balanced_pairs_score_high() {
        assert!(QaProcessor.can_process(FAQ, &Map::new()) >= 0.5);
    }

    #[test]
    fn prose_scores_zero() {
        assert_eq!(QaProcessor.can_process("Just a normal paragraph.", &Map::new()), 0.0);
    }

    #[tokio::test]
    async fn every_pair_after_the_first_gets_a_boundary() {
        let processed = QaProcessor.process(FAQ, &Map::new(), None).await.unwrap();
        assert_eq!(processed.document_metadata["qa_pair_count"], 2);
        assert_eq!(processed.hard_boundaries().len(), 1);
    }
}
