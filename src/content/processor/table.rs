use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{ChunkAnnotation, DomainProcessor, ProcessedDocument};

fn is_table_line(line: &str) -> bool {
    let trimmed = line.trim();
    (trimmed.starts_with('|') && trimmed.ends_with('|')) || trimmed.matches('\t').count() >= 2
}

/// Table-heavy document processor (spreadsheets, markdown tables). Table
/// blocks are kept whole for the chunker.
pub struct TableProcessor;

#[async_trait]
impl DomainProcessor for TableProcessor {
    fn name(&self) -> &'static str {
        "table"
    }

    fn can_process(&self, content: &str, metadata: &Map<String, Value>) -> f32 {
        if metadata.contains_key("sheets") {
            return 0.9;
        }
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() < 4 {
            return 0.0;
        }
        let table_lines = lines.iter().filter(|l| is_table_line(l)).count();
        let ratio = table_lines as f32 / lines.len() as f32;
        if ratio >= 0.5 {
            0.8
        } else if ratio >= 0.25 {
            0.4
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
        let mut processed = ProcessedDocument::passthrough(content, self.name(), 0.8);

        // Mark the start of each contiguous table block
        let mut table_count = 0usize;
        let mut in_table = false;
        let mut offset = 0usize;
        for line in content.split_inclusive('\n') {
            let starts_table = is_table_line(line);
            if starts_table && !in_table {
                table_count += 1;
                if offset > 0 {
                    processed
                        .annotations
                        .push(ChunkAnnotation::boundary("table_block", offset));
                }
            }
            in_table = starts_table;
            offset += line.len();
        }

        processed
            .document_metadata
            .insert("table_count".to_string(), json!(table_count));
        if let Some(sheets) = metadata.get("sheets") {
            processed
                .document_metadata
                .insert("sheets".to_string(), sheets.clone());
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLED: &str = "intro line\n| a | b |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |\n";

    #[test]
    fn spreadsheet_metadata_is_decisive() {
        let mut metadata = Map::new();
        metadata.insert("sheets".to_string(), json!([{"name": "s1"}]));
        assert!(TableProcessor.can_process("anything", &metadata) >= 0.9);
    }

    #[test]
    fn mostly_tabular_content_scores_high() {
        assert!(TableProcessor.can_process(TABLED, &Map::new()) >= 0.5);
    }

    #[tokio::test]
    async fn table_blocks_are_annotated() {
        let processed = TableProcessor.process(TABLED, &Map::new(), None).await.unwrap();
        assert_eq!(processed.document_metadata["table_count"], 1);
        assert_eq!(processed.hard_boundaries().len(), 1);
    }
}
