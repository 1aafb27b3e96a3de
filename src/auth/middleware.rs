use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::auth::api_key::hash_api_key;
use crate::state::AppState;
use crate::utils::error::ApiError;
use crate::utils::rate_limit::Identity;
use crate::utils::sanitize::safe_key_display;

/// The authenticated caller, attached to the request extensions.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: Uuid,
    pub email: String,
    pub api_key: String,
}

impl CurrentUser {
    pub fn identity(&self) -> Identity {
        Identity::ApiKey(self.api_key.clone())
    }
}

/// Pull the API key from `Authorization: Bearer`, `X-API-Key`, or the
/// `api_key` query parameter, in that order.
pub fn extract_api_key(request: &Request) -> Option<String> {
    if let Some(auth) = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
        // Bare key in the Authorization header is accepted too
        if !auth.trim().is_empty() && !auth.contains(' ') {
            return Some(auth.trim().to_string());
        }
    }

    if let Some(key) = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(key.trim().to_string());
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("api_key=")
                .map(|value| value.to_string())
        })
    })
}

/// Authentication middleware for protected routes.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = extract_api_key(&request)
        .ok_or_else(|| ApiError::Unauthorized("missing API key".to_string()))?;

    let user = state
        .repository
        .find_user_by_api_key_hash(&hash_api_key(&api_key))
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?
        .ok_or_else(|| ApiError::Unauthorized("invalid API key".to_string()))?;

    debug!(key = %safe_key_display(&api_key), user = %user.user_id, "authenticated");

    request.extensions_mut().insert(CurrentUser {
        user_id: user.user_id,
        email: user.email,
        api_key,
    });
    Ok(next.run(request).await)
}

/// Rate-limit identity for a request: the API key when present, the remote
/// address otherwise.
pub fn request_identity(request: &Request) -> Identity {
    if let Some(user) = request.extensions().get::<CurrentUser>() {
        return user.identity();
    }
    if let Some(key) = extract_api_key(request) {
        return Identity::ApiKey(key);
    }
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or_else(|| std::net::IpAddr::from([127, 0, 0, 1]));
    Identity::Ip(addr)
}
