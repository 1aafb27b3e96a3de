use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;

use super::{FileParser, ParsedFile};

const ACCEPTED: &[&str] = &[
    "application/json",
    "application/jsonl",
    "application/x-jsonlines",
    "text/json",
];

/// Byte budget per rendered section; sections break at record/key boundaries.
const MAX_SECTION_CHARS: usize = 2000;

/// JSON / JSONL parser. Values are flattened to `dot.path: value` lines so
/// keyword search sees the key names, and grouped into size-bounded sections.
pub struct JsonParser;

impl JsonParser {
    pub fn new() -> Self {
        Self
    }

    /// A file is JSONL when it is not one valid JSON document but at least
    /// 80% of its sampled lines are.
    fn is_jsonl(text: &str) -> bool {
        if serde_json::from_str::<Value>(text).is_ok() {
            return false;
        }
        let lines: Vec<&str> = text
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() {
            return false;
        }
        let sample: Vec<&&str> = lines.iter().take(10).collect();
        let valid = sample
            .iter()
            .filter(|l| serde_json::from_str::<Value>(l).is_ok())
            .count();
        valid * 10 >= sample.len() * 8
    }

    /// Depth-first flatten; arrays are treated as index-keyed objects.
    fn flatten(value: &Value, path: &mut Vec<String>, lines: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    path.push(key.clone());
                    Self::flatten(child, path, lines);
                    path.pop();
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    path.push(i.to_string());
                    Self::flatten(child, path, lines);
                    path.pop();
                }
            }
            Value::Null => lines.push(format!("{}: null", path.join("."))),
            Value::Bool(b) => lines.push(format!("{}: {}", path.join("."), b)),
            Value::Number(n) => lines.push(format!("{}: {}", path.join("."), n)),
            Value::String(s) => lines.push(format!("{}: {}", path.join("."), s)),
        }
    }

    /// Group flattened lines into sections bounded by `MAX_SECTION_CHARS`,
    /// never splitting a line.
    fn sectionize(lines: Vec<String>) -> String {
        let mut sections = Vec::new();
        let mut current = String::new();

        for line in lines {
            if !current.is_empty() && current.len() + line.len() + 1 > MAX_SECTION_CHARS {
                sections.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&line);
        }
        if !current.is_empty() {
            sections.push(current);
        }

        sections.join("\n\n")
    }

    fn parse_text(text: &str) -> Result<(String, bool, usize)> {
        if Self::is_jsonl(text) {
            let mut lines = Vec::new();
            let mut records = 0usize;
            for (i, line) in text
                .lines()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty())
                .enumerate()
            {
                let Ok(value) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                records += 1;
                let mut path = vec![i.to_string()];
                Self::flatten(&value, &mut path, &mut lines);
            }
            Ok((Self::sectionize(lines), true, records))
        } else {
            let value: Value = serde_json::from_str(text).context("invalid JSON document")?;
            let mut lines = Vec::new();
            Self::flatten(&value, &mut Vec::new(), &mut lines);
            Ok((Self::sectionize(lines), false, 1))
        }
    }
}

#[async_trait]
impl FileParser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        ACCEPTED.contains(&content_type)
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        let bytes = tokio::fs::read(path).await?;
        let text = String::from_utf8_lossy(&bytes);

        let (content, jsonl, records) = Self::parse_text(&text)?;

        let mut parsed = ParsedFile::with_content(content);
        parsed.metadata.insert(
            "format".to_string(),
            json!(if jsonl { "jsonl" } else { "json" }),
        );
        parsed.metadata.insert("records".to_string(), json!(records));
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_objects_with_dot_paths() {
        let (content, jsonl, records) =
            JsonParser::parse_text(r#"{"a": {"b": 1, "c": [true, "x"]}}"#).unwrap();
        assert!(!jsonl);
        assert_eq!(records, 1);
        assert!(content.contains("a.b: 1"));
        assert!(content.contains("a.c.0: true"));
        assert!(content.contains("a.c.1: x"));
    }

    #[test]
    fn detects_jsonl() {
        let text = "{\"id\": 1}\n{\"id\": 2}\n{\"id\": 3}";
        assert!(JsonParser::is_jsonl(text));
        let (content, jsonl, records) = JsonParser::parse_text(text).unwrap();
        assert!(jsonl);
        assert_eq!(records, 3);
        assert!(content.contains("0.id: 1"));
        assert!(content.contains("2.id: 3"));
    }

    #[test]
    fn single_document_is_not_jsonl() {
        assert!(!JsonParser::is_jsonl(r#"{"id": 1}"#));
    }

    #[test]
    fn sections_break_at_line_boundaries() {
        let lines: Vec<String> = (0..200).map(|i| format!("key.{}: value{}", i, i)).collect();
        let text = JsonParser::sectionize(lines);
        for section in text.split("\n\n") {
            assert!(section.len() <= MAX_SECTION_CHARS + 32);
            // No line is split mid-way
            for line in section.lines() {
                assert!(line.starts_with("key."));
            }
        }
    }

    #[test]
    fn invalid_json_errors() {
        assert!(JsonParser::parse_text("not json at all").is_err());
    }
}
