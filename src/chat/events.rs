//! SSE event envelope for chat streams.
//!
//! Every event serializes as `data: {"type": ..., ...}` and a stream always
//! terminates with exactly one `done` or one `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub chunk_index: i32,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    #[serde(rename = "type")]
    pub media_type: String,
    pub source_document_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub question: String,
    pub relevance: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub retrieval_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta {
        content: String,
    },
    Sources {
        sources: Vec<SourceRef>,
    },
    Media {
        media: Vec<MediaRef>,
    },
    FollowUp {
        follow_up_questions: Vec<FollowUpQuestion>,
    },
    ReasoningStep {
        step: usize,
        description: String,
    },
    SubQuery {
        query: String,
    },
    Usage {
        #[serde(flatten)]
        usage: Usage,
    },
    Done {
        session_id: Uuid,
        metadata: Value,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_snake_case_type_tags() {
        let event = StreamEvent::Delta {
            content: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "delta");
        assert_eq!(json["content"], "hi");

        let event = StreamEvent::FollowUp {
            follow_up_questions: vec![FollowUpQuestion {
                question: "More?".to_string(),
                relevance: 0.9,
            }],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "follow_up");

        let event = StreamEvent::ReasoningStep {
            step: 1,
            description: "expanding".to_string(),
        };
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "reasoning_step");
    }

    #[test]
    fn usage_flattens_into_the_envelope() {
        let event = StreamEvent::Usage {
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                retrieval_tokens: 7,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "usage");
        assert_eq!(json["prompt_tokens"], 10);
        assert_eq!(json["retrieval_tokens"], 7);
    }

    #[test]
    fn terminal_detection() {
        assert!(StreamEvent::Done {
            session_id: Uuid::new_v4(),
            metadata: serde_json::json!({})
        }
        .is_terminal());
        assert!(StreamEvent::Error {
            error: "x".to_string()
        }
        .is_terminal());
        assert!(!StreamEvent::Delta {
            content: "x".to_string()
        }
        .is_terminal());
    }
}
