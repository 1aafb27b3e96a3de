use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::path::Path;
use tracing::debug;

use super::{FileParser, ParsedFile};

/// Content type assigned by the ingestion coordinator when the payload is a
/// URL rather than an uploaded file.
pub const URI_CONTENT_TYPE: &str = "text/x-uri";

static TIMEDTEXT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<text start="([0-9.]+)"[^>]*>(.*?)</text>"#).expect("static regex")
});

/// Web transcript parser for YouTube-style URLs: extracts the video id,
/// fetches the timestamped transcript and oEmbed metadata.
pub struct WebTranscriptParser {
    client: reqwest::Client,
}

impl WebTranscriptParser {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Accepts short, watch, embed and /v/ URL forms.
    pub fn extract_video_id(url: &str) -> Option<String> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let host = parsed.host_str()?;

        if host == "youtu.be" {
            let id = parsed.path().trim_start_matches('/');
            return (!id.is_empty()).then(|| id.to_string());
        }

        if matches!(host, "www.youtube.com" | "youtube.com" | "m.youtube.com") {
            if parsed.path() == "/watch" {
                return parsed
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned());
            }
            for prefix in ["/embed/", "/v/"] {
                if let Some(rest) = parsed.path().strip_prefix(prefix) {
                    let id = rest.split('/').next().unwrap_or("");
                    return (!id.is_empty()).then(|| id.to_string());
                }
            }
        }

        None
    }

    fn unescape_xml(text: &str) -> String {
        text.replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
    }

    /// Render timedtext XML into `[mm:ss] line` form.
    fn render_transcript(xml: &str) -> String {
        let mut out = String::new();
        for capture in TIMEDTEXT_LINE.captures_iter(xml) {
            let start: f64 = capture[1].parse().unwrap_or(0.0);
            let minutes = (start / 60.0) as u64;
            let seconds = (start % 60.0) as u64;
            let text = Self::unescape_xml(capture[2].trim());
            if !text.is_empty() {
                out.push_str(&format!("[{:02}:{:02}] {}\n", minutes, seconds, text));
            }
        }
        out
    }

    async fn fetch_transcript(&self, video_id: &str) -> Result<String> {
        let url = format!(
            "https://video.google.com/timedtext?lang=en&v={}",
            video_id
        );
        let xml = self
            .client
            .get(&url)
            .send()
            .await
            .context("transcript fetch failed")?
            .text()
            .await?;

        let rendered = Self::render_transcript(&xml);
        if rendered.trim().is_empty() {
            anyhow::bail!("no transcript available for video {}", video_id);
        }
        Ok(rendered)
    }

    async fn fetch_oembed(&self, video_id: &str) -> Option<serde_json::Value> {
        let response = self
            .client
            .get("https://www.youtube.com/oembed")
            .query(&[
                (
                    "url",
                    format!("https://www.youtube.com/watch?v={}", video_id),
                ),
                ("format", "json".to_string()),
            ])
            .send()
            .await
            .ok()?;
        response.json().await.ok()
    }
}

#[async_trait]
impl FileParser for WebTranscriptParser {
    fn name(&self) -> &'static str {
        "web_transcript"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        content_type == URI_CONTENT_TYPE
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        let url = tokio::fs::read_to_string(path).await?.trim().to_string();

        let video_id = Self::extract_video_id(&url)
            .ok_or_else(|| anyhow::anyhow!("unrecognized video URL: {}", url))?;
        debug!("fetching transcript for video {}", video_id);

        let transcript = self.fetch_transcript(&video_id).await?;

        let mut parsed = ParsedFile::default();
        parsed
            .metadata
            .insert("media_type".to_string(), json!("web_video"));
        parsed.metadata.insert("video_id".to_string(), json!(video_id));
        parsed.metadata.insert("source_url".to_string(), json!(url));

        // oEmbed failures are noted in metadata, never fatal
        match self.fetch_oembed(&video_id).await {
            Some(oembed) => {
                if let Some(title) = oembed.get("title") {
                    parsed.metadata.insert("title".to_string(), title.clone());
                }
                if let Some(author) = oembed.get("author_name") {
                    parsed.metadata.insert("author".to_string(), author.clone());
                }
            }
            None => {
                parsed
                    .metadata
                    .insert("oembed_error".to_string(), json!("metadata unavailable"));
            }
        }

        parsed.content = transcript;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_id_from_all_url_forms() {
        for url in [
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://www.youtube.com/v/dQw4w9WgXcQ",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ&t=10s",
        ] {
            assert_eq!(
                WebTranscriptParser::extract_video_id(url).as_deref(),
                Some("dQw4w9WgXcQ"),
                "failed for {}",
                url
            );
        }
    }

    #[test]
    fn rejects_non_video_urls() {
        assert!(WebTranscriptParser::extract_video_id("https://example.com/watch?v=x").is_none());
        assert!(WebTranscriptParser::extract_video_id("not a url").is_none());
        assert!(WebTranscriptParser::extract_video_id("https://youtu.be/").is_none());
    }

    #[test]
    fn renders_timestamped_transcript() {
        let xml = r#"<?xml version="1.0"?><transcript>
            <text start="0.0" dur="2.0">hello there</text>
            <text start="65.5" dur="3.1">general &amp;amp; specific</text>
        </transcript>"#;
        let rendered = WebTranscriptParser::render_transcript(xml);
        assert!(rendered.contains("[00:00] hello there"));
        assert!(rendered.contains("[01:05]"));
    }
}
