use crate::config::VisionConfig;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct VisionDescription {
    pub description: String,
    pub ocr_text: Option<String>,
}

/// Port over the vision provider (figure description + OCR).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisionPort: Send + Sync {
    fn available(&self) -> bool;

    async fn describe_image(
        &self,
        image: &[u8],
        format: &str,
    ) -> Result<VisionDescription, ApiError>;
}

const VISION_PROMPT: &str = "Describe this image for a document search index. \
Start with a one-paragraph description, then, if the image contains readable \
text, add a section starting with 'TEXT:' containing a faithful transcription.";

#[derive(Debug, Deserialize)]
struct VisionResponse {
    choices: Vec<VisionChoice>,
}

#[derive(Debug, Deserialize)]
struct VisionChoice {
    message: VisionMessage,
}

#[derive(Debug, Deserialize)]
struct VisionMessage {
    content: Option<String>,
}

/// OpenAI-compatible vision client. Concurrency is capped by the shared
/// vision semaphore.
pub struct HttpVision {
    client: Client,
    config: VisionConfig,
    limiters: Arc<Limiters>,
}

impl HttpVision {
    pub fn new(config: VisionConfig, limiters: Arc<Limiters>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
            limiters,
        }
    }

    fn split_description(content: String) -> VisionDescription {
        match content.split_once("TEXT:") {
            Some((description, text)) => VisionDescription {
                description: description.trim().to_string(),
                ocr_text: Some(text.trim().to_string()).filter(|t| !t.is_empty()),
            },
            None => VisionDescription {
                description: content.trim().to_string(),
                ocr_text: None,
            },
        }
    }
}

#[async_trait]
impl VisionPort for HttpVision {
    fn available(&self) -> bool {
        self.config.enabled
    }

    async fn describe_image(
        &self,
        image: &[u8],
        format: &str,
    ) -> Result<VisionDescription, ApiError> {
        if !self.config.enabled {
            return Err(ApiError::Upstream("Vision service disabled".to_string()));
        }

        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.vision.clone(),
            self.limiters.acquire_timeout,
            "vision",
        )
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
        debug!(wait_ms = wait.as_millis() as u64, op = "vision", "wait_queue");

        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let data_uri = format!("data:image/{};base64,{}", format, encoded);

        let request = json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": VISION_PROMPT},
                    {"type": "image_url", "image_url": {"url": data_uri}}
                ]
            }],
            "max_tokens": 1024
        });

        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to reach vision service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "Vision API error ({}): {}",
                status, body
            )));
        }

        let body: VisionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to parse vision response: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::Upstream("Vision returned no content".to_string()))?;

        Ok(Self::split_description(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_ocr_section() {
        let parsed = HttpVision::split_description(
            "A bar chart of quarterly revenue.\nTEXT: Q1 10M Q2 12M".to_string(),
        );
        assert_eq!(parsed.description, "A bar chart of quarterly revenue.");
        assert_eq!(parsed.ocr_text.as_deref(), Some("Q1 10M Q2 12M"));
    }

    #[test]
    fn description_only_when_no_text_marker() {
        let parsed = HttpVision::split_description("A photo of a cat.".to_string());
        assert_eq!(parsed.description, "A photo of a cat.");
        assert!(parsed.ocr_text.is_none());
    }
}
