use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use crate::auth::{generate_api_key, hash_api_key, hash_password};
use crate::models::auth::{RegisterRequest, RegisterResponse};
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /auth/register. The API key appears in this response and nowhere
/// else, ever.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let email = request.email.trim().to_lowercase();
    if !email.contains('@') || email.len() < 3 {
        return Err(ApiError::invalid_field("email", "must be a valid address"));
    }
    if request.password.chars().count() < 8 {
        return Err(ApiError::invalid_field(
            "password",
            "must be at least 8 characters",
        ));
    }

    let credential_hash = hash_password(&request.password)?;
    let (api_key, prefix) = generate_api_key();
    let api_key_hash = hash_api_key(&api_key);

    let user = state
        .repository
        .create_user(&email, &credential_hash, &api_key_hash, &prefix)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                ApiError::Conflict("email already registered".to_string())
            } else {
                ApiError::Database(e.to_string())
            }
        })?;

    info!(user_id = %user.user_id, "user registered");

    Ok(Json(RegisterResponse {
        user_id: user.user_id,
        email: user.email,
        api_key,
    }))
}
