use anyhow::{Context, Result};
use async_trait::async_trait;
use mail_parser::{MessageParser, MimeHeaders};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::path::Path;

use super::{FileParser, ParsedFile};

const ACCEPTED: &[&str] = &[
    "message/rfc822",
    "application/vnd.ms-outlook",
    "text/x-email",
];

const HEADERS: &[&str] = &[
    "From",
    "To",
    "Cc",
    "Subject",
    "Date",
    "Message-ID",
    "In-Reply-To",
    "References",
];

static SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("static regex")
});

/// RFC 822 / Outlook email parser. Prefers the text/plain body and strips
/// HTML otherwise; attachment names and sizes land in metadata.
pub struct EmailParser;

impl EmailParser {
    pub fn new() -> Self {
        Self
    }

    fn strip_html(html: &str) -> String {
        let without_scripts = SCRIPT_STYLE.replace_all(html, " ");
        let fragment = scraper::Html::parse_document(&without_scripts);
        let text: Vec<&str> = fragment.root_element().text().collect();
        let joined = text.join(" ");
        joined.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn parse_bytes(bytes: &[u8]) -> Result<ParsedFile> {
        let message = MessageParser::default()
            .parse(bytes)
            .context("failed to parse email message")?;

        let mut content = String::new();
        let mut header_meta = serde_json::Map::new();

        // Header block first, so search hits on sender/subject
        for name in HEADERS {
            if let Some(value) = message.header_raw(*name) {
                let value = value.trim();
                if !value.is_empty() {
                    content.push_str(&format!("{}: {}\n", name, value));
                    header_meta.insert(name.to_lowercase(), json!(value));
                }
            }
        }
        content.push('\n');

        // Body: prefer text/plain, fall back to stripped HTML
        if let Some(text) = message.body_text(0) {
            content.push_str(text.trim());
        } else if let Some(html) = message.body_html(0) {
            content.push_str(&Self::strip_html(&html));
        }
        content.push('\n');

        let attachments: Vec<_> = message
            .attachments()
            .map(|part| {
                json!({
                    "filename": part.attachment_name(),
                    "size": part.contents().len(),
                })
            })
            .collect();

        let mut parsed = ParsedFile::with_content(content);
        parsed
            .metadata
            .insert("headers".to_string(), json!(header_meta));
        if !attachments.is_empty() {
            parsed
                .metadata
                .insert("attachments".to_string(), json!(attachments));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl FileParser for EmailParser {
    fn name(&self) -> &'static str {
        "email"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        ACCEPTED.contains(&content_type)
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        let bytes = tokio::fs::read(path).await?;
        tokio::task::spawn_blocking(move || Self::parse_bytes(&bytes)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: Ada <ada@example.com>\r\n\
To: Bob <bob@example.com>\r\n\
Subject: Quarterly report\r\n\
Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
Message-ID: <abc123@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Numbers attached. The Q4 close went well.\r\n";

    #[test]
    fn extracts_headers_and_body() {
        let parsed = EmailParser::parse_bytes(SAMPLE).unwrap();
        assert!(parsed.content.contains("Subject: Quarterly report"));
        assert!(parsed.content.contains("From: Ada <ada@example.com>"));
        assert!(parsed.content.contains("Q4 close went well"));

        let headers = parsed.metadata.get("headers").unwrap();
        assert_eq!(headers["subject"], "Quarterly report");
        assert_eq!(headers["message-id"], "<abc123@example.com>");
    }

    #[test]
    fn strips_html_bodies() {
        let text = EmailParser::strip_html(
            "<html><head><style>p{color:red}</style></head>\
             <body><p>Hello <b>world</b></p><script>alert(1)</script></body></html>",
        );
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color:red"));
    }
}
