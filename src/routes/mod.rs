use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    middleware::{self as axum_middleware},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::middleware;
use crate::tokens::{Claims, TokenIssuer};
use crate::users::{verify_password, NewUser, UserRepository};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub users: UserRepository,
    pub tokens: Arc<TokenIssuer>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build the state for a server run; a JWT secret is required
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let secret = config
            .jwt_secret
            .as_deref()
            .context("JWT_SECRET is required to serve")?;
        let tokens = TokenIssuer::new(secret, config.access_token_ttl, config.refresh_token_ttl);

        Ok(Self {
            users: UserRepository::new(),
            tokens: Arc::new(tokens),
            config,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_testing() -> Self {
        use crate::config::{Command, LogFormat};

        let config = Config {
            command: Command::Serve,
            server_host: "127.0.0.1".to_string(),
            server_port: 5000,
            cors_origin: None,
            jwt_secret: Some("unit-test-secret".to_string()),
            access_token_ttl: 3600,
            refresh_token_ttl: 604800,
            backend_url: "http://localhost:5000".to_string(),
            automator_url: "http://localhost:5000".to_string(),
            refresh_url: "http://localhost:5000".to_string(),
            store_path: std::path::PathBuf::from("/tmp/dware-session-test.sqlite3"),
            http_connect_timeout: 30,
            http_request_timeout: 60,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        };
        Self::new(Arc::new(config)).unwrap()
    }
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Signup and login (no authentication required)
pub fn auth_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/signup", post(signup_handler))
        .route("/api/auth/login", post(login_handler))
        .with_state(state)
}

/// Profile routes (require a valid access token)
pub fn user_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/getUserDetails", get(user_details_handler))
        .route("/api/users/profile", get(profile_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Access token renewal (authenticated by the refresh token in the body)
pub fn refresh_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/refresh/refreshToken", post(refresh_token_handler))
        .with_state(state)
}

/// All backend routes, without the outer CORS/trace layers
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(auth_routes(state.clone()))
        .merge(user_routes(state.clone()))
        .merge(refresh_routes(state))
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "DWare session service is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// POST /api/auth/signup - Register a new account
async fn signup_handler(
    State(state): State<AppState>,
    Json(request): Json<NewUser>,
) -> Result<(StatusCode, Json<Value>)> {
    tracing::info!(email = %request.email.trim(), "Request to /api/auth/signup");

    let users = state.users.clone();
    let record = tokio::task::spawn_blocking(move || users.create(&request))
        .await
        .context("Signup task failed")??;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": format!("User {} registered successfully", record.email)
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

/// POST /api/auth/login - Exchange credentials for an access/refresh token pair
async fn login_handler(
    State(state): State<AppState>,
    Json(request): Json<LoginBody>,
) -> Result<Json<Value>> {
    tracing::info!(email = %request.email.trim(), "Request to /api/auth/login");

    if request.email.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::ValidationError(
            "Email and password are required".to_string(),
        ));
    }

    let user = state
        .users
        .find_by_email(&request.email)
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let password = request.password;
    let hash = user.password_hash.clone();
    let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .context("Password check task failed")??;

    if !matches {
        tracing::warn!(user_id = user.user_id, "Login rejected: wrong password");
        return Err(ApiError::InvalidCredentials);
    }

    let token = state.tokens.issue_access(&user)?;
    let refresh_token = state.tokens.issue_refresh(&user)?;
    state
        .users
        .set_refresh_token(&user.email, Some(refresh_token.clone()));

    tracing::info!(user_id = user.user_id, "Login successful");

    Ok(Json(json!({
        "token": token,
        "refreshToken": refresh_token,
        "user": [user.to_profile_json()],
    })))
}

/// GET /api/getUserDetails - Profile of the token's principal, wrapped in `user`
async fn user_details_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>> {
    let user = state
        .users
        .find_by_id(claims.sub)
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    Ok(Json(json!({ "user": user.to_profile_json() })))
}

/// GET /api/users/profile - Profile of the token's principal
async fn profile_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>> {
    let user = state
        .users
        .find_by_id(claims.sub)
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    Ok(Json(user.to_profile_json()))
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct RefreshBody {
    #[serde(default)]
    emailID: String,
    #[serde(default)]
    refreshToken: String,
}

/// POST /api/refresh/refreshToken - Issue a new access token
///
/// The refresh token must be valid, belong to `emailID`, and be the one most
/// recently issued to that account.
async fn refresh_token_handler(
    State(state): State<AppState>,
    Json(request): Json<RefreshBody>,
) -> Result<Json<Value>> {
    if request.emailID.trim().is_empty() || request.refreshToken.trim().is_empty() {
        return Err(ApiError::Unauthorized(
            "Refresh token and email are required".to_string(),
        ));
    }

    let claims = state.tokens.verify_refresh(request.refreshToken.trim())?;
    let user = state
        .users
        .find_by_email(&request.emailID)
        .filter(|user| user.user_id == claims.sub)
        .ok_or_else(|| ApiError::Unauthorized("Invalid refresh token".to_string()))?;

    if user.refresh_token.as_deref() != Some(request.refreshToken.trim()) {
        tracing::warn!(user_id = user.user_id, "Refresh token was revoked or replaced");
        return Err(ApiError::Unauthorized("Invalid refresh token".to_string()));
    }

    let access_token = state.tokens.issue_access(&user)?;
    tracing::info!(user_id = user.user_id, "Access token refreshed");

    Ok(Json(json!({ "accessToken": access_token })))
}
