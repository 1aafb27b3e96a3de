//! File parsers: bytes on disk in, UTF-8 text plus metadata out.
//!
//! Each parser declares the content types it accepts; the factory holds them
//! in specificity order and returns the first match, so slide decks hit the
//! PowerPoint parser before the generic office parser and `text/*` acts as
//! the catch-all at the end of the list.

pub mod audio;
pub mod email;
pub mod image;
pub mod json;
pub mod office;
pub mod powerpoint;
pub mod spreadsheet;
pub mod text;
pub mod video;
pub mod web;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

use crate::config::IngestionConfig;
use crate::llm::{SpeechPort, VisionPort};

/// An image pulled out of a document during parsing, destined for the vision
/// port.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub bytes: Vec<u8>,
    pub page: usize,
    pub index: usize,
    pub format: String,
    pub filename: String,
}

#[derive(Debug, Default)]
pub struct ParsedFile {
    /// UTF-8 text, markdown where structure matters.
    pub content: String,
    pub metadata: Map<String, Value>,
    pub page_count: Option<usize>,
    pub images: Vec<ExtractedImage>,
}

impl ParsedFile {
    pub fn with_content(content: String) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait FileParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_parse(&self, content_type: &str) -> bool;

    async fn parse(&self, path: &Path) -> Result<ParsedFile>;
}

/// Ordered parser registry. Order matters: more specific parsers first.
pub struct ParserFactory {
    parsers: Vec<Arc<dyn FileParser>>,
}

impl ParserFactory {
    pub fn new(
        vision: Arc<dyn VisionPort>,
        speech: Arc<dyn SpeechPort>,
        config: &IngestionConfig,
    ) -> Self {
        let parsers: Vec<Arc<dyn FileParser>> = vec![
            Arc::new(email::EmailParser::new()),
            Arc::new(spreadsheet::SpreadsheetParser::new()),
            Arc::new(powerpoint::PowerPointParser::new()),
            Arc::new(office::OfficeParser::new()),
            Arc::new(json::JsonParser::new()),
            Arc::new(web::WebTranscriptParser::new()),
            Arc::new(image::ImageParser::new(vision)),
            Arc::new(video::VideoParser::new(
                speech.clone(),
                config.max_video_duration_seconds,
                config.temp_dir.clone(),
            )),
            Arc::new(audio::AudioParser::new(speech)),
            Arc::new(text::TextParser::new()),
        ];
        Self { parsers }
    }

    /// First parser accepting the content type, or None when unsupported.
    pub fn parser_for(&self, content_type: &str) -> Option<Arc<dyn FileParser>> {
        self.parsers
            .iter()
            .find(|p| p.can_parse(content_type))
            .cloned()
    }

    pub fn supports(&self, content_type: &str) -> bool {
        self.parser_for(content_type).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::speech::MockSpeechPort;
    use crate::llm::vision::MockVisionPort;

    fn factory() -> ParserFactory {
        ParserFactory::new(
            Arc::new(MockVisionPort::new()),
            Arc::new(MockSpeechPort::new()),
            &IngestionConfig::default(),
        )
    }

    #[test]
    fn powerpoint_wins_over_generic_office() {
        let f = factory();
        let parser = f
            .parser_for(
                "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            )
            .unwrap();
        assert_eq!(parser.name(), "powerpoint");
    }

    #[test]
    fn text_is_the_catch_all() {
        let f = factory();
        assert_eq!(f.parser_for("text/x-rst").unwrap().name(), "text");
        assert_eq!(f.parser_for("text/markdown").unwrap().name(), "text");
    }

    #[test]
    fn octet_stream_is_unsupported() {
        let f = factory();
        assert!(f.parser_for("application/octet-stream").is_none());
        assert!(!f.supports("application/x-msdownload"));
    }

    #[test]
    fn email_and_spreadsheet_route_to_their_parsers() {
        let f = factory();
        assert_eq!(f.parser_for("message/rfc822").unwrap().name(), "email");
        assert_eq!(
            f.parser_for("application/vnd.ms-excel").unwrap().name(),
            "spreadsheet"
        );
    }
}
