pub mod auth;
pub mod chat;
pub mod collections;
pub mod documents;
pub mod health;
pub mod retrievals;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::middleware::request_identity;
use crate::state::AppState;
use crate::utils::error::ApiError;
use crate::utils::rate_limit::EndpointClass;

async fn rate_limit(
    state: Arc<AppState>,
    class: EndpointClass,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = request_identity(&request);
    state.rate_limiter.check(class, &identity)?;
    Ok(next.run(request).await)
}

pub async fn rate_limit_chat(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    rate_limit(state, EndpointClass::Chat, request, next).await
}

pub async fn rate_limit_retrieval(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    rate_limit(state, EndpointClass::Retrieval, request, next).await
}

pub async fn rate_limit_upload(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    rate_limit(state, EndpointClass::Upload, request, next).await
}

pub async fn rate_limit_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    rate_limit(state, EndpointClass::Auth, request, next).await
}
