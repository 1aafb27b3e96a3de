use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{keyword_signal, ChunkAnnotation, DomainProcessor, ProcessedDocument};

const MANUAL_SIGNALS: &[&str] = &[
    "installation",
    "troubleshooting",
    "getting started",
    "prerequisites",
    "configuration",
    "warning:",
    "caution:",
    "user guide",
    "quick start",
];

static STEP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^\s*(step\s+\d+|\d+\.\s+[A-Z])").expect("static regex"));

/// Product / user manual processor: numbered steps and warning callouts.
pub struct ManualProcessor;

#[async_trait]
impl DomainProcessor for ManualProcessor {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn can_process(&self, content: &str, _metadata: &Map<String, Value>) -> f32 {
        let lower = content.to_lowercase();
        let mut score = keyword_signal(&lower, MANUAL_SIGNALS, 3);
        if STEP_LINE.find_iter(content).count() >= 3 {
            score += 0.2;
        }
        score.min(0.9)
    }

    async fn process(
        &self,
        content: &str,
        _metadata: &Map<String, Value>,
        _filename: Option<&str>,
    ) -> Result<ProcessedDocument> {
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.6);

        let steps = STEP_LINE.find_iter(content).count();
        processed
            .document_metadata
            .insert("step_count".to_string(), json!(steps));
        processed
            .document_metadata
            .insert("document_kind".to_string(), json!("manual"));

        let lower = content.to_lowercase();
        for marker in ["warning:", "caution:"] {
            for (offset, _) in lower.match_indices(marker) {
                processed.annotations.push(ChunkAnnotation {
                    kind: "safety_callout".to_string(),
                    value: json!(marker.trim_end_matches(':')),
                    preserve_boundary: false,
                    start: Some(offset),
                });
            }
        }

        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANUAL: &str = "Getting Started\n\nPrerequisites: a vacuum.\n\
Step 1. Unbox the unit.\nStep 2. Charge the battery.\nStep 3. Pair the app.\n\
Warning: do not submerge.\nTroubleshooting\nIf it fails, restart.";

    #[test]
    fn manuals_score_above_threshold() {
        assert!(ManualProcessor.can_process(MANUAL, &Map::new()) >= 0.3);
    }

    #[tokio::test]
    async fn steps_and_callouts_are_recorded() {
        let processed = ManualProcessor.process(MANUAL, &Map::new(), None).await.unwrap();
        assert_eq!(processed.document_metadata["step_count"], 3);
        assert!(processed
            .annotations
            .iter()
            .any(|a| a.kind == "safety_callout"));
    }
}
