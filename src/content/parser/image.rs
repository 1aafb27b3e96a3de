use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use super::{FileParser, ParsedFile};
use crate::llm::VisionPort;

const ACCEPTED: &[&str] = &["image/png", "image/jpeg", "image/webp"];

/// Standalone image ingestion: the vision port produces a description plus
/// any readable text, and that becomes the document content.
pub struct ImageParser {
    vision: Arc<dyn VisionPort>,
}

impl ImageParser {
    pub fn new(vision: Arc<dyn VisionPort>) -> Self {
        Self { vision }
    }
}

#[async_trait]
impl FileParser for ImageParser {
    fn name(&self) -> &'static str {
        "image"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        ACCEPTED.contains(&content_type)
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        if !self.vision.available() {
            anyhow::bail!("vision service unavailable, cannot ingest images");
        }

        let bytes = tokio::fs::read(path).await?;
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png")
            .to_lowercase();

        let described = self
            .vision
            .describe_image(&bytes, &format)
            .await
            .context("vision description failed")?;

        let mut content = described.description.clone();
        if let Some(ocr) = &described.ocr_text {
            content.push_str("\n\n");
            content.push_str(ocr);
        }

        let mut parsed = ParsedFile::with_content(content);
        parsed
            .metadata
            .insert("media_type".to_string(), json!("image"));
        parsed.metadata.insert("format".to_string(), json!(format));
        parsed.metadata.insert(
            "has_ocr_text".to_string(),
            json!(described.ocr_text.is_some()),
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::vision::{MockVisionPort, VisionDescription};

    #[tokio::test]
    async fn combines_description_and_ocr() {
        let mut vision = MockVisionPort::new();
        vision.expect_available().return_const(true);
        vision.expect_describe_image().returning(|_, _| {
            Ok(VisionDescription {
                description: "An architecture diagram.".to_string(),
                ocr_text: Some("API -> queue -> worker".to_string()),
            })
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagram.png");
        tokio::fs::write(&path, b"fakepng").await.unwrap();

        let parser = ImageParser::new(Arc::new(vision));
        let parsed = parser.parse(&path).await.unwrap();
        assert!(parsed.content.contains("architecture diagram"));
        assert!(parsed.content.contains("API -> queue -> worker"));
        assert_eq!(parsed.metadata["media_type"], "image");
    }

    #[tokio::test]
    async fn errors_when_vision_unavailable() {
        let mut vision = MockVisionPort::new();
        vision.expect_available().return_const(false);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagram.png");
        tokio::fs::write(&path, b"fakepng").await.unwrap();

        let parser = ImageParser::new(Arc::new(vision));
        assert!(parser.parse(&path).await.is_err());
    }
}
