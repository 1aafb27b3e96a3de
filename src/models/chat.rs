use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::retrieval::RetrievalMode;
use crate::utils::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Brief,
    #[default]
    Comprehensive,
    Academic,
    Technical,
    Exploratory,
    Qna,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningMode {
    #[default]
    Standard,
    Deep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageInput {
    pub role: String,
    pub content: String,
}

fn default_chat_top_k() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRetrievalOptions {
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default = "default_chat_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub rerank: bool,
    #[serde(default)]
    pub enable_graph: bool,
    #[serde(default)]
    pub hierarchical: bool,
    #[serde(default)]
    pub expand_context: bool,
    pub metadata_filter: Option<Value>,
}

impl Default for ChatRetrievalOptions {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            top_k: default_chat_top_k(),
            rerank: false,
            enable_graph: false,
            hierarchical: false,
            expand_context: false,
            metadata_filter: None,
        }
    }
}

/// Vendor-neutral generation knobs; provider-specific extras are not modeled.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GenerationOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// Either a full message list or a single `message` must be present.
    pub messages: Option<Vec<ChatMessageInput>>,
    pub message: Option<String>,
    pub session_id: Option<Uuid>,
    pub collection_id: Option<Uuid>,
    pub model: Option<String>,
    #[serde(default)]
    pub preset: Preset,
    #[serde(default)]
    pub reasoning_mode: ReasoningMode,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub retrieval: ChatRetrievalOptions,
    #[serde(default)]
    pub generation: GenerationOptions,
    pub custom_instruction: Option<String>,
    pub custom_system_prompt: Option<String>,
    #[serde(default)]
    pub is_follow_up: bool,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl ChatRequest {
    /// Resolve the user's message from either form of the request.
    pub fn user_message(&self) -> Option<String> {
        if let Some(message) = &self.message {
            if !message.trim().is_empty() {
                return Some(message.clone());
            }
        }
        self.messages.as_ref().and_then(|msgs| {
            msgs.iter()
                .rev()
                .find(|m| m.role == "user" && !m.content.trim().is_empty())
                .map(|m| m.content.clone())
        })
    }

    pub fn validate(&self, max_message_chars: usize) -> Result<String, ApiError> {
        let message = self
            .user_message()
            .ok_or_else(|| ApiError::invalid_field("message", "a user message is required"))?;
        if message.chars().count() > max_message_chars {
            return Err(ApiError::invalid_field(
                "message",
                format!("must be at most {} characters", max_message_chars),
            ));
        }
        Ok(message)
    }

    pub fn effective_top_k(&self, max_top_k: usize) -> usize {
        self.retrieval.top_k.clamp(1, max_top_k)
    }
}

/// Non-streaming chat response (`stream = false`).
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub session_id: Uuid,
    pub content: String,
    pub sources: Vec<crate::chat::events::SourceRef>,
    pub usage: crate::chat::events::Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_resolution_prefers_single_message() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"message": "hello", "messages": [{"role": "user", "content": "older"}]}"#,
        )
        .unwrap();
        assert_eq!(req.user_message().unwrap(), "hello");
    }

    #[test]
    fn message_resolution_falls_back_to_last_user_turn() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "answer"},
                {"role": "user", "content": "second"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(req.user_message().unwrap(), "second");
    }

    #[test]
    fn validates_message_length() {
        let req: ChatRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert!(req.validate(10_000).is_ok());
        assert!(req.validate(1).is_err());
    }

    #[test]
    fn defaults_are_streaming_standard_comprehensive() {
        let req: ChatRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert!(req.stream);
        assert_eq!(req.preset, Preset::Comprehensive);
        assert_eq!(req.reasoning_mode, ReasoningMode::Standard);
        assert_eq!(req.retrieval.mode, RetrievalMode::Hybrid);
    }

    #[test]
    fn chat_top_k_clamps_to_twenty() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"message": "hi", "retrieval": {"top_k": 200}}"#).unwrap();
        assert_eq!(req.effective_top_k(20), 20);
    }
}
