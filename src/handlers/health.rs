use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::AppState;

pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Readiness: the database must answer.
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    sqlx::query("SELECT 1")
        .execute(state.db_pool.get_pool())
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({"status": "ready"})))
}
