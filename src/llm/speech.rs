use crate::config::SpeechConfig;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Port over the speech-to-text provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechPort: Send + Sync {
    fn available(&self) -> bool;

    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<Transcript, ApiError>;
}

/// Whisper-style `/v1/audio/transcriptions` client.
pub struct HttpSpeech {
    client: Client,
    config: SpeechConfig,
}

impl HttpSpeech {
    pub fn new(config: SpeechConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }
}

#[async_trait]
impl SpeechPort for HttpSpeech {
    fn available(&self) -> bool {
        self.config.enabled
    }

    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<Transcript, ApiError> {
        if !self.config.enabled {
            return Err(ApiError::Upstream("Speech service disabled".to_string()));
        }

        debug!("Transcribing {} ({} bytes)", filename, audio.len());

        let part = multipart::Part::bytes(audio)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("response_format", "verbose_json");

        let url = format!("{}/v1/audio/transcriptions", self.config.base_url);
        let mut builder = self.client.post(&url).multipart(form);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to reach speech service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "Speech API error ({}): {}",
                status, body
            )));
        }

        let transcript: Transcript = response
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to parse transcript: {}", e)))?;

        if transcript.text.trim().is_empty() {
            return Err(ApiError::Upstream("Empty transcript returned".to_string()));
        }

        Ok(transcript)
    }
}
