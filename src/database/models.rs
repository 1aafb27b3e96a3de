use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Document lifecycle. Monotonic except for `failed -> pending` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub email: String,
    pub credential_hash: String,
    pub api_key_hash: String,
    pub api_key_prefix: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CollectionRow {
    pub collection_id: Uuid,
    #[serde(skip_serializing)]
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub metadata: Value,
    pub config: Value,
    pub document_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionRow {
    /// Typed view of the free-form config column.
    pub fn parsed_config(&self) -> crate::models::collection::CollectionConfig {
        serde_json::from_value(self.config.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DocumentRow {
    pub document_id: Uuid,
    pub collection_id: Uuid,
    #[serde(skip_serializing)]
    pub user_id: Uuid,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub content_type: String,
    pub size_bytes: i64,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_identifier_hash: Option<String>,
    pub status: String,
    pub metadata: Value,
    pub processing_info: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub collection_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub token_count: i32,
    pub metadata: Value,
    pub annotations: Value,
}

/// A chunk scored by a search, joined with its document fields.
#[derive(Debug, Clone, FromRow)]
pub struct ScoredChunkRow {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub collection_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub token_count: i32,
    pub metadata: Value,
    pub annotations: Value,
    pub score: f64,
    pub document_title: Option<String>,
    pub document_filename: Option<String>,
    pub document_metadata: Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct DocumentSummaryHit {
    pub document_id: Uuid,
    pub score: f64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChatSessionRow {
    pub session_id: Uuid,
    #[serde(skip_serializing)]
    pub user_id: Uuid,
    pub collection_id: Option<Uuid>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChatMessageRow {
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DocumentStatusRow {
    pub status: String,
    pub processing_info: Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub chunk_count: i64,
    pub total_tokens: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DocumentStatus::parse("unknown"), None);
    }
}
