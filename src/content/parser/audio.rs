use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use super::{FileParser, ParsedFile};
use crate::llm::SpeechPort;

/// Audio ingestion via the speech-to-text port. The transcript becomes the
/// document content; duration and language land in metadata.
pub struct AudioParser {
    speech: Arc<dyn SpeechPort>,
}

impl AudioParser {
    pub fn new(speech: Arc<dyn SpeechPort>) -> Self {
        Self { speech }
    }
}

#[async_trait]
impl FileParser for AudioParser {
    fn name(&self) -> &'static str {
        "audio"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        content_type.starts_with("audio/")
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        if !self.speech.available() {
            anyhow::bail!("speech service unavailable, cannot ingest audio");
        }

        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();

        let transcript = self
            .speech
            .transcribe(bytes, &filename)
            .await
            .context("transcription failed")?;

        let mut parsed = ParsedFile::with_content(transcript.text);
        parsed
            .metadata
            .insert("media_type".to_string(), json!("audio"));
        if let Some(language) = transcript.language {
            parsed.metadata.insert("language".to_string(), json!(language));
        }
        if let Some(duration) = transcript.duration {
            parsed
                .metadata
                .insert("duration_seconds".to_string(), json!(duration));
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::speech::{MockSpeechPort, Transcript};

    #[tokio::test]
    async fn transcript_becomes_content() {
        let mut speech = MockSpeechPort::new();
        speech.expect_available().return_const(true);
        speech.expect_transcribe().returning(|_, _| {
            Ok(Transcript {
                text: "welcome to the weekly standup".to_string(),
                language: Some("en".to_string()),
                duration: Some(62.5),
            })
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standup.mp3");
        tokio::fs::write(&path, b"fakemp3").await.unwrap();

        let parser = AudioParser::new(Arc::new(speech));
        let parsed = parser.parse(&path).await.unwrap();
        assert_eq!(parsed.content, "welcome to the weekly standup");
        assert_eq!(parsed.metadata["language"], "en");
        assert_eq!(parsed.metadata["duration_seconds"], 62.5);
    }
}
