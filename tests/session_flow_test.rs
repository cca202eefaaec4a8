// Session flow tests
//
// Drive the client-side auth service against mocked backends and against a
// live instance of the backend router.

use axum::{
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use mockito::Matcher;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast::error::TryRecvError, Notify};

use dware_session::{
    auth::{
        AuthEndpoints, AuthError, AuthEvent, AuthService, CredentialStore, GuardDecision,
        IdentityKind, KeyValueStore, LogoutReason, MemoryStore, SessionState, SqliteStore,
    },
    config::{Command, Config, LogFormat},
    routes::{self, AppState},
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

fn service(backend: &MemoryStore, url: &str) -> Arc<AuthService> {
    Arc::new(AuthService::new(
        reqwest::Client::new(),
        AuthEndpoints::new(url, url),
        CredentialStore::new(Arc::new(backend.clone())),
    ))
}

fn snapshot(backend: &MemoryStore) -> Vec<Option<String>> {
    ["token", "refreshToken", "user", "clientToken", "clientUser"]
        .iter()
        .map(|key| backend.get(key).unwrap())
        .collect()
}

/// Serve `app` on an ephemeral port and return its base URL
async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ==================================================================================================
// Login
// ==================================================================================================

#[tokio::test]
async fn test_login_persists_token_and_profile() {
    let mut server = mockito::Server::new_async().await;
    let login = server
        .mock("POST", "/api/auth/login")
        .match_body(Matcher::Json(json!({"email": "a@b.com", "password": "Secret1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"token":"T1","refreshToken":"R1","user":[{"emailID":"a@b.com","firstName":"A","password":null}]}"#,
        )
        .create_async()
        .await;
    let details = server
        .mock("GET", "/api/getUserDetails")
        .match_header("authorization", "Bearer T1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"user":{"emailID":"a@b.com","firstName":"A"}}"#)
        .create_async()
        .await;

    let backend = MemoryStore::new();
    let auth = service(&backend, &server.url());
    let mut events = auth.subscribe();

    let user = auth.login("a@b.com", "Secret1").await.unwrap();
    assert_eq!(user.first_name, "A");

    assert_eq!(backend.get("token").unwrap().as_deref(), Some("T1"));
    assert_eq!(backend.get("refreshToken").unwrap().as_deref(), Some("R1"));
    let stored: Value = serde_json::from_str(&backend.get("user").unwrap().unwrap()).unwrap();
    assert_eq!(stored["firstName"], "A");
    assert!(stored.get("password").is_none());

    assert_eq!(auth.state(), SessionState::Authenticated);
    assert_eq!(auth.guard(), GuardDecision::Render);
    assert_eq!(
        events.try_recv().unwrap(),
        AuthEvent::LoggedIn {
            kind: IdentityKind::Developer
        }
    );
    assert_eq!(events.try_recv().unwrap(), AuthEvent::ProfileUpdated);

    login.assert_async().await;
    details.assert_async().await;
}

#[tokio::test]
async fn test_failed_login_leaves_store_unchanged() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/auth/login")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"Invalid credentials"}"#)
        .create_async()
        .await;

    let backend = MemoryStore::new();
    backend.set("clientToken", "C1").unwrap();
    backend.set("clientUser", r#"{"emailID":"c@d.com"}"#).unwrap();
    let before = snapshot(&backend);

    let auth = service(&backend, &server.url());
    let result = auth.login("a@b.com", "wrong").await;

    match result {
        Err(AuthError::CredentialsInvalid(message)) => assert_eq!(message, "Invalid credentials"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(snapshot(&backend), before);
}

#[tokio::test]
async fn test_login_server_error_is_upstream() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/auth/login")
        .with_status(503)
        .with_body("maintenance")
        .create_async()
        .await;

    let backend = MemoryStore::new();
    let auth = service(&backend, &server.url());

    let result = auth.login("a@b.com", "Secret1").await;
    assert!(matches!(result, Err(AuthError::Upstream { status: 503, .. })));
    assert!(backend.is_empty());
}

#[tokio::test]
async fn test_client_login_takes_first_profile() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/users/authenticateUser")
        .match_body(Matcher::Json(json!({"EmailID": "c@d.com", "Password": "Secret1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"token":"C1","user":[{"EmailID":"c@d.com","FirstName":"Cleo","masterRoleID":"3"},{"EmailID":"other@d.com"}]}"#,
        )
        .create_async()
        .await;

    let backend = MemoryStore::new();
    let auth = service(&backend, &server.url());

    let user = auth.client_login("c@d.com", "Secret1").await.unwrap();
    assert_eq!(user.email_id, "c@d.com");
    assert_eq!(user.first_name, "Cleo");
    assert_eq!(user.master_role_id, 3);

    assert_eq!(backend.get("clientToken").unwrap().as_deref(), Some("C1"));
    assert!(backend.get("clientUser").unwrap().is_some());
    assert!(backend.get("token").unwrap().is_none());
    assert!(backend.get("refreshToken").unwrap().is_none());
    assert_eq!(auth.guard(), GuardDecision::Render);
}

// ==================================================================================================
// Refresh
// ==================================================================================================

#[tokio::test]
async fn test_401_refreshes_and_retries_once() {
    let mut server = mockito::Server::new_async().await;
    let stale = server
        .mock("GET", "/api/getUserDetails")
        .match_header("authorization", "Bearer T_old")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/api/refresh/refreshToken")
        .match_body(Matcher::Json(json!({"emailID": "a@b.com", "refreshToken": "R1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"accessToken":"T_new"}"#)
        .expect(1)
        .create_async()
        .await;
    let fresh = server
        .mock("GET", "/api/getUserDetails")
        .match_header("authorization", "Bearer T_new")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"user":{"emailID":"a@b.com","firstName":"A"}}"#)
        .expect(1)
        .create_async()
        .await;

    let backend = MemoryStore::new();
    backend.set("token", "T_old").unwrap();
    backend.set("refreshToken", "R1").unwrap();
    backend.set("user", r#"{"emailID":"a@b.com"}"#).unwrap();

    let auth = service(&backend, &server.url());
    let mut events = auth.subscribe();

    let user = auth.fetch_user_details().await.unwrap();
    assert_eq!(user.first_name, "A");
    assert_eq!(backend.get("token").unwrap().as_deref(), Some("T_new"));
    assert_eq!(events.try_recv().unwrap(), AuthEvent::TokenRefreshed);
    assert_eq!(events.try_recv().unwrap(), AuthEvent::ProfileUpdated);

    stale.assert_async().await;
    refresh.assert_async().await;
    fresh.assert_async().await;
}

#[tokio::test]
async fn test_401_twice_gives_up_after_one_retry() {
    let mut server = mockito::Server::new_async().await;
    let details = server
        .mock("GET", "/api/getUserDetails")
        .with_status(401)
        .expect(2)
        .create_async()
        .await;
    server
        .mock("POST", "/api/refresh/refreshToken")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"accessToken":"T2"}"#)
        .create_async()
        .await;

    let backend = MemoryStore::new();
    backend.set("token", "T1").unwrap();
    backend.set("refreshToken", "R1").unwrap();
    backend.set("user", r#"{"emailID":"a@b.com"}"#).unwrap();

    let auth = service(&backend, &server.url());
    let result = auth.fetch_user_details().await;

    assert!(matches!(result, Err(AuthError::SessionExpired)));
    assert!(backend.is_empty());
    details.assert_async().await;
}

#[tokio::test]
async fn test_401_without_refresh_token_logs_out_once() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/getUserDetails")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/api/refresh/refreshToken")
        .expect(0)
        .create_async()
        .await;

    let backend = MemoryStore::new();
    backend.set("token", "T1").unwrap();
    backend.set("user", r#"{"emailID":"a@b.com"}"#).unwrap();
    backend.set("clientToken", "C1").unwrap();
    backend.set("clientUser", r#"{"emailID":"c@d.com"}"#).unwrap();

    let auth = service(&backend, &server.url());
    let mut events = auth.subscribe();

    let result = auth.fetch_user_details().await;
    assert!(matches!(result, Err(AuthError::RefreshFailed)));

    assert!(backend.is_empty());
    assert_eq!(
        events.try_recv().unwrap(),
        AuthEvent::LoggedOut {
            reason: LogoutReason::SessionExpired
        }
    );
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(auth.guard(), GuardDecision::Redirect { to: "/login" });
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_refresh_without_token_makes_no_call() {
    let mut server = mockito::Server::new_async().await;
    let refresh = server
        .mock("POST", "/api/refresh/refreshToken")
        .expect(0)
        .create_async()
        .await;

    let backend = MemoryStore::new();
    backend.set("token", "T1").unwrap();
    backend.set("user", r#"{"emailID":"a@b.com"}"#).unwrap();

    let auth = service(&backend, &server.url());
    assert!(!auth.refresh_token().await);
    assert_eq!(backend.get("token").unwrap().as_deref(), Some("T1"));
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_rejected_refresh_keeps_storage() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/refresh/refreshToken")
        .with_status(401)
        .with_body(r#"{"message":"Invalid refresh token"}"#)
        .create_async()
        .await;

    let backend = MemoryStore::new();
    backend.set("token", "T1").unwrap();
    backend.set("refreshToken", "R1").unwrap();
    backend.set("user", r#"{"emailID":"a@b.com"}"#).unwrap();
    let before = snapshot(&backend);

    let auth = service(&backend, &server.url());
    assert!(!auth.refresh_token().await);
    assert_eq!(snapshot(&backend), before);
    assert_eq!(auth.state(), SessionState::Authenticated);
}

// ==================================================================================================
// Profile failures
// ==================================================================================================

#[tokio::test]
async fn test_profile_not_found_ends_session() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/getUserDetails")
        .with_status(404)
        .with_body(r#"{"message":"User not found"}"#)
        .create_async()
        .await;

    let backend = MemoryStore::new();
    backend.set("token", "T1").unwrap();
    backend.set("user", r#"{"emailID":"a@b.com"}"#).unwrap();

    let auth = service(&backend, &server.url());
    let mut events = auth.subscribe();

    let result = auth.fetch_user_details().await;
    assert!(matches!(result, Err(AuthError::Upstream { status: 404, .. })));
    assert!(backend.is_empty());
    assert_eq!(
        events.try_recv().unwrap(),
        AuthEvent::LoggedOut {
            reason: LogoutReason::ProfileUnavailable
        }
    );
}

// ==================================================================================================
// Concurrency
// ==================================================================================================

#[tokio::test]
async fn test_login_resolving_after_logout_is_discarded() {
    let arrived = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let app = Router::new().route(
        "/api/auth/login",
        post({
            let arrived = arrived.clone();
            let release = release.clone();
            move || {
                let arrived = arrived.clone();
                let release = release.clone();
                async move {
                    arrived.notify_one();
                    release.notified().await;
                    Json(json!({
                        "token": "T_late",
                        "refreshToken": "R_late",
                        "user": [{"emailID": "a@b.com", "firstName": "A"}]
                    }))
                }
            }
        }),
    );
    let url = spawn_server(app).await;

    let backend = MemoryStore::new();
    let auth = service(&backend, &url);

    let pending = tokio::spawn({
        let auth = auth.clone();
        async move { auth.login("a@b.com", "Secret1").await }
    });

    arrived.notified().await;
    auth.logout();
    release.notify_one();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(AuthError::Cancelled)));
    assert!(backend.is_empty());
    assert!(auth.current_user().is_none());
    assert_eq!(auth.state(), SessionState::Anonymous);
}

/// Backend whose refresh endpoint blocks until `release` is notified.
/// Only `Bearer T_new` is accepted by `getUserDetails`.
fn held_refresh_app(arrived: Arc<Notify>, release: Arc<Notify>) -> Router {
    Router::new()
        .route(
            "/api/getUserDetails",
            get(|headers: HeaderMap| async move {
                let bearer = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if bearer == "Bearer T_new" {
                    (
                        StatusCode::OK,
                        Json(json!({"user": {"emailID": "a@b.com", "firstName": "A"}})),
                    )
                } else {
                    (
                        StatusCode::UNAUTHORIZED,
                        Json(json!({"message": "Token has expired"})),
                    )
                }
            }),
        )
        .route(
            "/api/refresh/refreshToken",
            post(move || {
                let arrived = arrived.clone();
                let release = release.clone();
                async move {
                    arrived.notify_one();
                    release.notified().await;
                    Json(json!({"accessToken": "T_new"}))
                }
            }),
        )
        .route(
            "/api/users/authenticateUser",
            post(|| async {
                Json(json!({
                    "token": "C1",
                    "user": [{"EmailID": "c@d.com", "FirstName": "Cleo"}]
                }))
            }),
        )
        .route(
            "/api/auth/login",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"message": "Invalid credentials"})),
                )
            }),
        )
}

fn expired_developer_session() -> MemoryStore {
    let backend = MemoryStore::new();
    backend.set("token", "T_old").unwrap();
    backend.set("refreshToken", "R1").unwrap();
    backend.set("user", r#"{"emailID":"a@b.com"}"#).unwrap();
    backend
}

#[tokio::test]
async fn test_client_login_during_refresh_keeps_both_sessions() {
    let arrived = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let url = spawn_server(held_refresh_app(arrived.clone(), release.clone())).await;

    let backend = expired_developer_session();
    let auth = service(&backend, &url);

    let pending = tokio::spawn({
        let auth = auth.clone();
        async move { auth.fetch_user_details().await }
    });

    arrived.notified().await;
    let client_user = auth.client_login("c@d.com", "Secret1").await.unwrap();
    assert_eq!(client_user.first_name, "Cleo");
    release.notify_one();

    let user = pending.await.unwrap().unwrap();
    assert_eq!(user.first_name, "A");

    assert_eq!(backend.get("token").unwrap().as_deref(), Some("T_new"));
    assert_eq!(backend.get("refreshToken").unwrap().as_deref(), Some("R1"));
    assert_eq!(backend.get("clientToken").unwrap().as_deref(), Some("C1"));
    assert!(backend.get("clientUser").unwrap().is_some());
}

#[tokio::test]
async fn test_failed_login_during_refresh_keeps_session() {
    let arrived = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let url = spawn_server(held_refresh_app(arrived.clone(), release.clone())).await;

    let backend = expired_developer_session();
    let auth = service(&backend, &url);
    let mut events = auth.subscribe();

    let pending = tokio::spawn({
        let auth = auth.clone();
        async move { auth.fetch_user_details().await }
    });

    arrived.notified().await;
    let result = auth.login("a@b.com", "wrong").await;
    assert!(matches!(result, Err(AuthError::CredentialsInvalid(_))));
    release.notify_one();

    let user = pending.await.unwrap().unwrap();
    assert_eq!(user.first_name, "A");
    assert_eq!(backend.get("token").unwrap().as_deref(), Some("T_new"));
    assert_eq!(events.try_recv().unwrap(), AuthEvent::TokenRefreshed);
    assert_eq!(events.try_recv().unwrap(), AuthEvent::ProfileUpdated);
}

#[tokio::test]
async fn test_logout_during_refresh_discards_token() {
    let arrived = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let url = spawn_server(held_refresh_app(arrived.clone(), release.clone())).await;

    let backend = expired_developer_session();
    let auth = service(&backend, &url);
    let mut events = auth.subscribe();

    let pending = tokio::spawn({
        let auth = auth.clone();
        async move { auth.fetch_user_details().await }
    });

    arrived.notified().await;
    auth.logout();
    release.notify_one();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(AuthError::Cancelled)));
    assert!(backend.is_empty());
    assert_eq!(
        events.try_recv().unwrap(),
        AuthEvent::LoggedOut {
            reason: LogoutReason::UserRequested
        }
    );
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

// ==================================================================================================
// End to end against the real backend
// ==================================================================================================

fn backend_config() -> Config {
    Config {
        command: Command::Serve,
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        cors_origin: None,
        jwt_secret: Some("end-to-end-secret".to_string()),
        access_token_ttl: 3600,
        refresh_token_ttl: 604800,
        backend_url: String::new(),
        automator_url: String::new(),
        refresh_url: String::new(),
        store_path: std::path::PathBuf::from("/tmp/dware-session-e2e.sqlite3"),
        http_connect_timeout: 30,
        http_request_timeout: 60,
        log_level: "info".to_string(),
        log_format: LogFormat::Text,
    }
}

#[tokio::test]
async fn test_full_session_against_backend() {
    let state = AppState::new(Arc::new(backend_config())).unwrap();
    let url = spawn_server(routes::build_router(state)).await;

    let client = reqwest::Client::new();
    let signup = client
        .post(format!("{}/api/auth/signup", url))
        .json(&json!({
            "firstName": "Dana",
            "lastName": "Lee",
            "email": "dana@example.com",
            "password": "Password1"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(signup.status(), 201);

    let store = CredentialStore::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
    let auth = AuthService::new(
        client,
        AuthEndpoints::new(&url, &url).with_refresh_url(&url),
        store,
    );

    let user = auth.login("dana@example.com", "Password1").await.unwrap();
    assert_eq!(user.first_name, "Dana");
    assert_eq!(user.email_id, "dana@example.com");
    assert_eq!(auth.guard(), GuardDecision::Render);

    let before = auth.store().access_token(IdentityKind::Developer).unwrap();
    assert!(auth.refresh_token().await);
    let after = auth.store().access_token(IdentityKind::Developer).unwrap();
    assert_ne!(before, after);

    let user = auth.fetch_user_details().await.unwrap();
    assert_eq!(user.last_name, "Lee");

    auth.logout();
    assert!(!auth.store().has_access_token(IdentityKind::Developer));
    assert_eq!(auth.guard(), GuardDecision::Redirect { to: "/login" });
}

#[tokio::test]
async fn test_unknown_user_against_backend() {
    let state = AppState::new(Arc::new(backend_config())).unwrap();
    let url = spawn_server(routes::build_router(state)).await;

    let backend = MemoryStore::new();
    let auth = service(&backend, &url);

    let result = auth.login("ghost@example.com", "Password1").await;
    match result {
        Err(AuthError::CredentialsInvalid(message)) => assert_eq!(message, "User not found"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(backend.is_empty());
}
