use anyhow::{Context, Result};
use async_trait::async_trait;
use lopdf::{Document, Object};
use serde_json::json;
use std::path::Path;
use tracing::{debug, warn};

use super::{ExtractedImage, FileParser, ParsedFile};

const ACCEPTED: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

/// PDF and Word parser. PDFs go through the structured extractor first and
/// fall back to a raw content-stream scan when that yields nothing.
pub struct OfficeParser;

impl OfficeParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_pdf(path: &Path) -> Result<ParsedFile> {
        let doc = Document::load(path).context("failed to load PDF")?;
        let pages = doc.get_pages();
        let page_count = pages.len();

        let mut content = String::new();
        for page_num in 1..=page_count as u32 {
            if let Ok(text) = doc.extract_text(&[page_num]) {
                content.push_str(&text);
                content.push('\n');
            }
        }

        let mut extraction_method = "structured";
        if content.trim().is_empty() {
            warn!("structured PDF extraction empty, falling back to raw scan");
            content = Self::raw_pdf_text(&doc);
            extraction_method = "fallback";
        }

        let images = Self::extract_pdf_images(&doc);

        let mut parsed = ParsedFile::with_content(content);
        parsed.page_count = Some(page_count);
        parsed.images = images;
        parsed
            .metadata
            .insert("extraction_method".to_string(), json!(extraction_method));
        Ok(parsed)
    }

    /// Last-resort extractor: walk every stream, keep printable runs.
    fn raw_pdf_text(doc: &Document) -> String {
        let mut out = String::new();
        for (_, object) in doc.objects.iter() {
            let Object::Stream(stream) = object else {
                continue;
            };
            let data = stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone());
            let text = String::from_utf8_lossy(&data);
            for run in text
                .split(|c: char| c.is_control())
                .filter(|s| s.len() > 3 && s.chars().any(|c| c.is_alphabetic()))
            {
                out.push_str(run.trim());
                out.push('\n');
            }
        }
        out
    }

    /// Collect embedded JPEG XObjects per page. Non-JPEG encodings are
    /// skipped; the vision port only needs the common case.
    fn extract_pdf_images(doc: &Document) -> Vec<ExtractedImage> {
        let mut images = Vec::new();

        for (page_num, page_id) in doc.get_pages() {
            let Ok(page_dict) = doc.get_dictionary(page_id) else {
                continue;
            };
            let Ok(resources) = page_dict
                .get(b"Resources")
                .and_then(|r| doc.dereference(r).map(|(_, o)| o))
                .and_then(|o| o.as_dict())
            else {
                continue;
            };
            let Ok(xobjects) = resources
                .get(b"XObject")
                .and_then(|x| doc.dereference(x).map(|(_, o)| o))
                .and_then(|o| o.as_dict())
            else {
                continue;
            };

            for (name, value) in xobjects.iter() {
                let Ok((_, object)) = doc.dereference(value) else {
                    continue;
                };
                let Ok(stream) = object.as_stream() else {
                    continue;
                };
                let is_image = stream
                    .dict
                    .get(b"Subtype")
                    .and_then(|s| s.as_name())
                    .map(|n| n == b"Image")
                    .unwrap_or(false);
                if !is_image {
                    continue;
                }
                let is_jpeg = match stream.dict.get(b"Filter") {
                    Ok(Object::Name(n)) => n == b"DCTDecode",
                    Ok(Object::Array(filters)) => filters
                        .iter()
                        .any(|f| f.as_name().map(|n| n == b"DCTDecode").unwrap_or(false)),
                    _ => false,
                };
                if !is_jpeg {
                    continue;
                }

                let index = images.len();
                images.push(ExtractedImage {
                    bytes: stream.content.clone(),
                    page: page_num as usize,
                    index,
                    format: "jpeg".to_string(),
                    filename: format!(
                        "page{}_{}.jpg",
                        page_num,
                        String::from_utf8_lossy(name)
                    ),
                });
            }
        }

        debug!("extracted {} images from PDF", images.len());
        images
    }

    fn parse_docx(path: &Path) -> Result<ParsedFile> {
        use docx_rs::{DocumentChild, ParagraphChild, RunChild};

        let data = std::fs::read(path)?;
        let docx = docx_rs::read_docx(&data).context("failed to read DOCX")?;

        let mut content = String::new();
        for child in docx.document.children {
            if let DocumentChild::Paragraph(para) = child {
                for child in para.children {
                    if let ParagraphChild::Run(run) = child {
                        for child in run.children {
                            if let RunChild::Text(text) = child {
                                content.push_str(&text.text);
                            }
                        }
                    }
                }
                content.push('\n');
            }
        }

        let mut parsed = ParsedFile::with_content(content);
        parsed
            .metadata
            .insert("extraction_method".to_string(), json!("structured"));
        Ok(parsed)
    }
}

#[async_trait]
impl FileParser for OfficeParser {
    fn name(&self) -> &'static str {
        "office"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        ACCEPTED.contains(&content_type)
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        let path = path.to_path_buf();
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false)
            || {
                let prefix = std::fs::read(&path)
                    .ok()
                    .map(|b| b.iter().take(5).copied().collect::<Vec<_>>());
                prefix.as_deref() == Some(b"%PDF-")
            };

        // Decoding is CPU-bound; keep it off the async runtime
        tokio::task::spawn_blocking(move || {
            if is_pdf {
                Self::parse_pdf(&path)
            } else {
                Self::parse_docx(&path)
            }
        })
        .await?
    }
}
