use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-collection processing configuration. Fields left unset fall back to
/// the server defaults from `Settings`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CollectionConfig {
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<usize>,
    pub chunk_size_tokens: Option<usize>,
    pub chunk_overlap_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub config: Option<CollectionConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateCollectionRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub config: Option<CollectionConfig>,
}

impl CreateCollectionRequest {
    pub fn validate(&self) -> Result<(), crate::utils::ApiError> {
        if self.name.trim().is_empty() {
            return Err(crate::utils::ApiError::invalid_field(
                "name",
                "must not be empty",
            ));
        }
        if self.name.len() > 255 {
            return Err(crate::utils::ApiError::invalid_field(
                "name",
                "must be at most 255 characters",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        let req = CreateCollectionRequest {
            name: "  ".to_string(),
            description: None,
            metadata: None,
            config: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn accepts_normal_name() {
        let req = CreateCollectionRequest {
            name: "papers".to_string(),
            description: Some("arxiv PDFs".to_string()),
            metadata: None,
            config: Some(CollectionConfig {
                chunk_size_tokens: Some(256),
                ..Default::default()
            }),
        };
        assert!(req.validate().is_ok());
    }
}
