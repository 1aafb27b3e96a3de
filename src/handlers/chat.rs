use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::stream::Stream;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::chat::StreamEvent;
use crate::database::{ChatMessageRow, ChatSessionRow};
use crate::models::chat::ChatRequest;
use crate::models::pagination::ListParams;
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /chat. SSE stream by default; a single JSON completion with
/// `stream = false`.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    // Reject malformed requests with a proper status before any streaming
    request.validate(state.settings.chat.max_message_chars)?;

    info!(user_id = %user.user_id, stream = request.stream, "chat request");

    if !request.stream {
        let response = state
            .orchestrator
            .clone()
            .complete(user.user_id, request)
            .await?;
        return Ok(Json(response).into_response());
    }

    let stream = sse_stream(state.orchestrator.clone().run(user.user_id, request));
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Serialize orchestrator events as `data: {...}` records, stopping after
/// the first terminal event so a stream never carries two terminators.
fn sse_stream(
    events: impl Stream<Item = StreamEvent> + Send,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let mut terminated = false;
    events
        .take_while(move |event| {
            let keep = !terminated;
            terminated = event.is_terminal();
            futures::future::ready(keep)
        })
        .map(|event| {
            let payload = serde_json::to_string(&event)
                .unwrap_or_else(|_| r#"{"type":"error","error":"serialization failed"}"#.to_string());
            Ok(Event::default().data(payload))
        })
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ChatSessionRow>>, ApiError> {
    let (limit, offset) = params.clamped();
    let sessions = state
        .repository
        .list_sessions(user.user_id, limit, offset)
        .await?;
    Ok(Json(sessions))
}

/// GET /chat/sessions/{id}/messages, in chronological order.
pub async fn session_messages(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<ChatMessageRow>>, ApiError> {
    // Ownership check before exposing any content
    state
        .repository
        .get_session(user.user_id, session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;

    let messages = state.repository.list_messages(session_id).await?;
    Ok(Json(messages))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .repository
        .delete_session(user.user_id, session_id)
        .await?;
    if !deleted {
        return Err(ApiError::NotFound("session not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}
