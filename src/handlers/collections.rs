use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::database::CollectionRow;
use crate::models::collection::{CreateCollectionRequest, UpdateCollectionRequest};
use crate::models::pagination::{ListParams, Paginated};
use crate::state::AppState;
use crate::utils::error::ApiError;

pub async fn create_collection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(request): Json<CreateCollectionRequest>,
) -> Result<Json<CollectionRow>, ApiError> {
    request.validate()?;

    let metadata = request.metadata.unwrap_or_else(|| json!({}));
    let config = request
        .config
        .map(|c| serde_json::to_value(c).unwrap_or_else(|_| json!({})))
        .unwrap_or_else(|| json!({}));

    let collection = state
        .repository
        .create_collection(
            user.user_id,
            request.name.trim(),
            request.description.as_deref(),
            metadata,
            config,
        )
        .await?;

    info!(collection_id = %collection.collection_id, "collection created");
    Ok(Json(collection))
}

pub async fn list_collections(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(params): Query<ListParams>,
) -> Result<Json<Paginated<CollectionRow>>, ApiError> {
    let (limit, offset) = params.clamped();
    let (collections, total) = state
        .repository
        .list_collections(user.user_id, limit, offset)
        .await?;
    Ok(Json(Paginated::new(collections, total, limit, offset)))
}

pub async fn get_collection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(collection_id): Path<Uuid>,
) -> Result<Json<CollectionRow>, ApiError> {
    let collection = state
        .repository
        .get_collection(user.user_id, collection_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("collection not found".to_string()))?;
    Ok(Json(collection))
}

pub async fn update_collection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(collection_id): Path<Uuid>,
    Json(request): Json<UpdateCollectionRequest>,
) -> Result<Json<CollectionRow>, ApiError> {
    if let Some(name) = &request.name {
        if name.trim().is_empty() {
            return Err(ApiError::invalid_field("name", "must not be empty"));
        }
    }

    let config = request
        .config
        .map(|c| serde_json::to_value(c).unwrap_or_else(|_| json!({})));

    let collection = state
        .repository
        .update_collection(
            user.user_id,
            collection_id,
            request.name.as_deref().map(str::trim),
            request.description.as_deref(),
            request.metadata,
            config,
        )
        .await?
        .ok_or_else(|| ApiError::NotFound("collection not found".to_string()))?;
    Ok(Json(collection))
}

pub async fn delete_collection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(collection_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .repository
        .delete_collection(user.user_id, collection_id)
        .await?;
    if !deleted {
        return Err(ApiError::NotFound("collection not found".to_string()));
    }

    // The in-process indexes drop the whole collection with it
    state.keyword_index.remove_collection(collection_id);
    state.graph_index.remove_collection(collection_id).await;
    info!(%collection_id, "collection deleted");
    Ok(StatusCode::NO_CONTENT)
}
