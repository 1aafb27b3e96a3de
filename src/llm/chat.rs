use crate::config::LlmConfig;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use futures::stream::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Vendor-neutral generation parameters. Unset fields are omitted from the
/// wire request so provider defaults apply.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

/// Port over the chat completion provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<String, ApiError>;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<TokenStream, ApiError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// OpenAI-compatible chat completion client.
pub struct OpenAiChatModel {
    client: Client,
    config: LlmConfig,
}

impl OpenAiChatModel {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }

    fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
        stream: bool,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens.or(Some(self.config.max_tokens)),
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            stream,
        }
    }

    async fn send(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to call LLM API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "LLM API error: {} - {}",
                status, body
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<String, ApiError> {
        debug!("Chat completion with {} messages", messages.len());

        let request = self.build_request(messages, params, false);
        let response = self.send(&request).await?;

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to parse LLM response: {}", e)))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::Upstream("LLM returned no choices".to_string()))
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<TokenStream, ApiError> {
        debug!("Starting chat stream with {} messages", messages.len());

        let request = self.build_request(messages, params, true);
        let response = self.send(&request).await?;

        let bytes_stream = response.bytes_stream();

        // SSE lines may be split across network frames; carry the remainder
        // between polls.
        let parsed = async_stream::stream! {
            use futures::StreamExt;

            let mut bytes_stream = bytes_stream;
            let mut buffer = String::new();

            while let Some(frame) = bytes_stream.next().await {
                let frame = match frame {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(ApiError::Upstream(format!("Stream error: {}", e)));
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&frame));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(payload) {
                        if let Some(content) =
                            chunk.choices.first().and_then(|c| c.delta.content.as_ref())
                        {
                            if !content.is_empty() {
                                yield Ok(content.clone());
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(parsed))
    }
}
