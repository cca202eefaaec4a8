// Authentication and CORS middleware

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::routes::AppState;

/// Authentication middleware
///
/// Expects `Authorization: Bearer <access JWT>`. On success the decoded
/// [`Claims`](crate::tokens::Claims) are inserted into the request extensions
/// for the handlers downstream.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    let Some(token) = token.filter(|t| !t.is_empty()) else {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        tracing::warn!(
            "[{}] Access attempt without bearer token: {} {}",
            request_id,
            request.method(),
            request.uri().path()
        );
        return Err(ApiError::Unauthorized("No token provided".to_string()));
    };

    let claims = state.tokens.verify_access(&token).map_err(|err| {
        tracing::debug!(path = %request.uri().path(), error = %err, "Rejected access token");
        err
    })?;

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Create CORS middleware layer
///
/// With an origin configured, only that origin is allowed and credentials are
/// permitted. Without one, any origin is accepted.
pub fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS];

    match origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
            .allow_credentials(true),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    }
}
