use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::admin::AppState;

/// Bearer token of the request, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Require the admin api key.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if bearer_token(request.headers()) == Some(state.config.admin.api_key.as_str()) {
        return Ok(next.run(request).await);
    }
    tracing::debug!(path = %request.uri().path(), "Rejected admin request without valid api key");
    Err(StatusCode::UNAUTHORIZED)
}

/// Agents may register with the registration token or the api key.
pub fn registration_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(presented) = bearer_token(headers) else {
        return false;
    };
    presented == state.config.admin.api_key
        || state
            .config
            .admin
            .registration_token
            .as_deref()
            .is_some_and(|t| t == presented)
}
