use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

use super::{FileParser, ParsedFile};

/// Catch-all for `text/*`. UTF-8 with a lossy fallback through encoding
/// detection, so legacy exports still ingest.
pub struct TextParser;

impl TextParser {
    pub fn new() -> Self {
        Self
    }

    fn decode(bytes: &[u8]) -> (String, &'static str) {
        match std::str::from_utf8(bytes) {
            Ok(s) => (s.to_string(), "utf-8"),
            Err(_) => {
                let (decoded, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
                if had_errors {
                    (String::from_utf8_lossy(bytes).into_owned(), "utf-8-lossy")
                } else {
                    (decoded.into_owned(), "windows-1252")
                }
            }
        }
    }
}

#[async_trait]
impl FileParser for TextParser {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        content_type.starts_with("text/")
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        let bytes = tokio::fs::read(path).await?;
        let (content, encoding) = Self::decode(&bytes);

        let mut parsed = ParsedFile::with_content(content);
        parsed.metadata.insert("encoding".to_string(), json!(encoding));
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_utf8() {
        let (text, enc) = TextParser::decode("héllo wörld".as_bytes());
        assert_eq!(text, "héllo wörld");
        assert_eq!(enc, "utf-8");
    }

    #[test]
    fn falls_back_on_latin1() {
        // 0xE9 is é in windows-1252 but invalid UTF-8
        let (text, enc) = TextParser::decode(b"caf\xe9");
        assert_eq!(text, "café");
        assert_eq!(enc, "windows-1252");
    }

    #[tokio::test]
    async fn parses_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        tokio::fs::write(&path, "some plain text").await.unwrap();

        let parsed = TextParser::new().parse(&path).await.unwrap();
        assert_eq!(parsed.content, "some plain text");
        assert!(parsed.page_count.is_none());
    }
}
