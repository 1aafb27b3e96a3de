use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{FileParser, ParsedFile};
use crate::llm::SpeechPort;

/// Per-extraction ceiling for the speech-to-text step.
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct VideoProbe {
    duration_seconds: f64,
    resolution: Option<String>,
    codec: Option<String>,
}

/// Video ingestion: probe metadata, extract the audio track with ffmpeg,
/// then transcribe. Videos above the configured duration cap are rejected
/// before any transcription work happens.
pub struct VideoParser {
    speech: Arc<dyn SpeechPort>,
    max_duration_seconds: u64,
    temp_dir: Option<String>,
}

impl VideoParser {
    pub fn new(
        speech: Arc<dyn SpeechPort>,
        max_duration_seconds: u64,
        temp_dir: Option<String>,
    ) -> Self {
        Self {
            speech,
            max_duration_seconds,
            temp_dir,
        }
    }

    fn temp_path(&self, suffix: &str) -> PathBuf {
        let base = self
            .temp_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        base.join(format!("extract_{}.{}", uuid::Uuid::new_v4(), suffix))
    }

    async fn probe(path: &Path) -> Result<VideoProbe> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .context("ffprobe not available")?;

        if !output.status.success() {
            anyhow::bail!("ffprobe failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;

        let duration_seconds = parsed["format"]["duration"]
            .as_str()
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| anyhow::anyhow!("video has no duration"))?;

        let video_stream = parsed["streams"]
            .as_array()
            .and_then(|streams| {
                streams
                    .iter()
                    .find(|s| s["codec_type"].as_str() == Some("video"))
            })
            .cloned();

        let resolution = video_stream.as_ref().and_then(|s| {
            match (s["width"].as_i64(), s["height"].as_i64()) {
                (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
                _ => None,
            }
        });
        let codec = video_stream
            .as_ref()
            .and_then(|s| s["codec_name"].as_str().map(String::from));

        Ok(VideoProbe {
            duration_seconds,
            resolution,
            codec,
        })
    }

    async fn extract_audio(&self, path: &Path) -> Result<PathBuf> {
        let audio_path = self.temp_path("wav");

        let output = Command::new("ffmpeg")
            .args(["-y", "-i"])
            .arg(path)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-f", "wav"])
            .arg(&audio_path)
            .output()
            .await
            .context("ffmpeg not available")?;

        if !output.status.success() {
            anyhow::bail!(
                "audio extraction failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(audio_path)
    }
}

#[async_trait]
impl FileParser for VideoParser {
    fn name(&self) -> &'static str {
        "video"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        content_type.starts_with("video/")
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        if !self.speech.available() {
            anyhow::bail!("speech service unavailable, cannot ingest video");
        }

        let probe = Self::probe(path).await?;
        if probe.duration_seconds > self.max_duration_seconds as f64 {
            anyhow::bail!(
                "video duration {:.0}s exceeds the maximum of {}s",
                probe.duration_seconds,
                self.max_duration_seconds
            );
        }

        let audio_path = self.extract_audio(path).await?;
        debug!("extracted audio to {}", audio_path.display());

        let audio = tokio::fs::read(&audio_path).await;
        let _ = tokio::fs::remove_file(&audio_path).await;
        let audio = audio?;

        let transcript = tokio::time::timeout(
            TRANSCRIBE_TIMEOUT,
            self.speech.transcribe(audio, "extracted.wav"),
        )
        .await
        .map_err(|_| anyhow::anyhow!("transcription exceeded the 5 minute ceiling"))?
        .context("transcription failed")?;

        let mut parsed = ParsedFile::with_content(transcript.text);
        parsed
            .metadata
            .insert("media_type".to_string(), json!("video"));
        parsed.metadata.insert(
            "duration_seconds".to_string(),
            json!(probe.duration_seconds),
        );
        if let Some(resolution) = probe.resolution {
            parsed
                .metadata
                .insert("resolution".to_string(), json!(resolution));
        }
        if let Some(codec) = probe.codec {
            parsed.metadata.insert("codec".to_string(), json!(codec));
        }
        if let Some(language) = transcript.language {
            parsed.metadata.insert("language".to_string(), json!(language));
        }
        Ok(parsed)
    }
}
