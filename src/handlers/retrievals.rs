use axum::{extract::State, Extension, Json};
use std::sync::Arc;
use tracing::info;

use crate::auth::CurrentUser;
use crate::models::retrieval::{RetrievalRequest, RetrievalResponse};
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /retrievals. Returns pre-rerank order; reranking is a chat-side
/// concern.
pub async fn retrieve(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(request): Json<RetrievalRequest>,
) -> Result<Json<RetrievalResponse>, ApiError> {
    info!(
        mode = request.mode.as_str(),
        top_k = request.top_k,
        "retrieval request"
    );
    let response = state.engine.retrieve(user.user_id, &request).await?;
    Ok(Json(response))
}
