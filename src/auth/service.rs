use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use super::error::AuthError;
use super::guard::{GuardDecision, RouteGuard};
use super::profile::UserProfile;
use super::refresh::{self, token_prefix};
use super::store::CredentialStore;
use super::types::{
    AuthEvent, AuthenticateUserRequest, IdentityKind, LoginRequest, LoginResponse, LogoutReason,
    MessageBody, Session, SessionState, UserDetailsResponse,
};

/// Retries allowed after a successful refresh
const MAX_AUTH_RETRIES: u32 = 1;

/// Buffered auth events per subscriber
const EVENT_CAPACITY: usize = 16;

/// Base URLs of the services the session talks to
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    /// Our own backend (`/api/auth/login`, `/api/getUserDetails`)
    pub backend_url: String,
    /// Automation platform (`/api/users/authenticateUser`)
    pub automator_url: String,
    /// Host of `/api/refresh/refreshToken`
    pub refresh_url: String,
}

impl AuthEndpoints {
    /// Refresh goes to the automation platform unless overridden
    pub fn new(backend_url: impl Into<String>, automator_url: impl Into<String>) -> Self {
        let automator_url = automator_url.into();
        Self {
            backend_url: backend_url.into(),
            refresh_url: automator_url.clone(),
            automator_url,
        }
    }

    pub fn with_refresh_url(mut self, refresh_url: impl Into<String>) -> Self {
        self.refresh_url = refresh_url.into();
        self
    }

    fn login_url(&self) -> String {
        join_url(&self.backend_url, "/api/auth/login")
    }

    fn user_details_url(&self) -> String {
        join_url(&self.backend_url, "/api/getUserDetails")
    }

    fn authenticate_url(&self) -> String {
        join_url(&self.automator_url, "/api/users/authenticateUser")
    }

    fn refresh_token_url(&self) -> String {
        join_url(&self.refresh_url, "/api/refresh/refreshToken")
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// In-memory half of the session, kept consistent with the credential store
struct SessionInner {
    user: Option<UserProfile>,
    state: SessionState,
    /// Per-kind session generation, bumped when that kind's session is replaced or on logout
    epochs: [u64; 2],
    /// Per-kind login attempt counter; only the newest attempt may commit
    attempts: [u64; 2],
}

impl SessionInner {
    fn epoch(&self, kind: IdentityKind) -> u64 {
        self.epochs[slot(kind)]
    }
}

fn slot(kind: IdentityKind) -> usize {
    match kind {
        IdentityKind::Developer => 0,
        IdentityKind::Client => 1,
    }
}

/// Ticket taken when a login starts
#[derive(Debug, Clone, Copy)]
struct LoginAttempt {
    attempt: u64,
    epoch: u64,
}

/// Result of a developer token refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Refreshed,
    Failed,
    /// The session was replaced or logged out while the refresh was in flight
    Superseded,
}

/// Authentication service
/// Owns login, profile refresh, token refresh and logout for both identity kinds
pub struct AuthService {
    client: Client,
    endpoints: AuthEndpoints,
    store: CredentialStore,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthService {
    /// Create the service and rehydrate any persisted session.
    ///
    /// A stored session is trusted optimistically; the token is only
    /// validated when the first protected call fails.
    pub fn new(client: Client, endpoints: AuthEndpoints, store: CredentialStore) -> Self {
        let restored = IdentityKind::ALL.iter().find_map(|kind| store.read(*kind));

        let (user, state) = match restored {
            Some(session) => {
                tracing::info!(
                    kind = %session.kind,
                    user = %session.user.display_name(),
                    "Restored persisted session"
                );
                (Some(session.user), SessionState::Authenticated)
            }
            None => (None, SessionState::Anonymous),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            client,
            endpoints,
            store,
            inner: Mutex::new(SessionInner {
                user,
                state,
                epochs: [0; 2],
                attempts: [0; 2],
            }),
            events,
        }
    }

    /// HTTP client with the configured timeouts
    pub fn build_client(connect_timeout: u64, request_timeout: u64) -> Result<Client> {
        Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Receive login/logout/refresh notifications
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner().user.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Render-or-redirect decision for a protected view
    pub fn guard(&self) -> GuardDecision {
        let inner = self.inner();
        RouteGuard::check(inner.user.as_ref(), &self.store)
    }

    /// Log in against our backend as a developer
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, AuthError> {
        let attempt = self.begin_login_attempt(IdentityKind::Developer);
        tracing::info!(email = email, "Logging in (developer)");

        let response = self
            .client
            .post(self.endpoints.login_url())
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let payload = read_login_response(response).await?;
        let user = UserProfile::from_wire(&payload.user)?;

        if payload.token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "Login response does not contain a token".to_string(),
            ));
        }

        let session = Session {
            kind: IdentityKind::Developer,
            access_token: payload.token,
            refresh_token: payload.refresh_token.filter(|t| !t.is_empty()),
            user,
        };
        self.establish(attempt, session)?;

        // Pull the canonical profile; failures here have already logged us out
        self.fetch_user_details().await
    }

    /// Log in directly against the automation platform as a client
    pub async fn client_login(&self, email: &str, password: &str) -> Result<UserProfile, AuthError> {
        let attempt = self.begin_login_attempt(IdentityKind::Client);
        tracing::info!(email = email, "Logging in (client)");

        let response = self
            .client
            .post(self.endpoints.authenticate_url())
            .json(&AuthenticateUserRequest {
                email_id: email,
                password,
            })
            .send()
            .await?;

        let payload = read_login_response(response).await?;
        let user = UserProfile::from_wire(&payload.user)?;

        if payload.token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "Authentication response does not contain a token".to_string(),
            ));
        }

        let session = Session {
            kind: IdentityKind::Client,
            access_token: payload.token,
            refresh_token: None,
            user: user.clone(),
        };
        self.establish(attempt, session)?;

        Ok(user)
    }

    /// Reload the canonical developer profile.
    ///
    /// A 401 triggers one refresh and one retry. Any other failure ends the
    /// session.
    pub async fn fetch_user_details(&self) -> Result<UserProfile, AuthError> {
        match self.load_user_details().await {
            Ok(user) => Ok(user),
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch user details");
                let reason = if e.is_session_fatal() {
                    LogoutReason::SessionExpired
                } else {
                    LogoutReason::ProfileUnavailable
                };
                self.end_session(reason);
                Err(e)
            }
        }
    }

    async fn load_user_details(&self) -> Result<UserProfile, AuthError> {
        let epoch = self.inner().epoch(IdentityKind::Developer);
        let url = self.endpoints.user_details_url();

        let response = self
            .send_authorized(IdentityKind::Developer, |client, token| {
                client.get(&url).bearer_auth(token)
            })
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let body: UserDetailsResponse = response.json().await.map_err(|e| {
            AuthError::InvalidResponse(format!("Failed to parse user details: {}", e))
        })?;
        let user = UserProfile::from_wire(&body.user)?;

        {
            let mut inner = self.inner();
            if inner.epoch(IdentityKind::Developer) != epoch {
                tracing::debug!("Discarding user details fetched for a replaced session");
                return Err(AuthError::Cancelled);
            }
            self.store
                .set_user(IdentityKind::Developer, &user)
                .map_err(AuthError::Storage)?;
            inner.user = Some(user.clone());
            inner.state = SessionState::Authenticated;
        }

        tracing::info!(user = %user.display_name(), "User details updated");
        self.emit(AuthEvent::ProfileUpdated);
        Ok(user)
    }

    /// Mint a new developer access token from the stored refresh token.
    ///
    /// Returns false without any network call when the refresh token or the
    /// stored email is missing. Storage is only touched on success.
    pub async fn refresh_token(&self) -> bool {
        self.refresh_developer().await == RefreshOutcome::Refreshed
    }

    async fn refresh_developer(&self) -> RefreshOutcome {
        let Some(refresh_token) = self.store.refresh_token(IdentityKind::Developer) else {
            tracing::debug!("No refresh token stored, cannot refresh");
            return RefreshOutcome::Failed;
        };

        let email = self
            .store
            .read(IdentityKind::Developer)
            .map(|session| session.user.email_id)
            .filter(|email| !email.is_empty());
        let Some(email) = email else {
            tracing::debug!("No stored email for refresh");
            return RefreshOutcome::Failed;
        };

        let (epoch, previous_state) = {
            let mut inner = self.inner();
            let previous = inner.state;
            inner.state = SessionState::Refreshing;
            (inner.epoch(IdentityKind::Developer), previous)
        };

        let result = refresh::request_new_access_token(
            &self.client,
            &self.endpoints.refresh_token_url(),
            &email,
            &refresh_token,
        )
        .await;

        let mut inner = self.inner();
        if inner.epoch(IdentityKind::Developer) != epoch {
            tracing::debug!("Developer session replaced during refresh, dropping new token");
            return RefreshOutcome::Superseded;
        }

        match result {
            Ok(access_token) => {
                if let Err(e) = self
                    .store
                    .set_access_token(IdentityKind::Developer, &access_token)
                {
                    tracing::error!(error = %e, "Failed to persist refreshed token");
                    inner.state = previous_state;
                    return RefreshOutcome::Failed;
                }
                inner.state = SessionState::Authenticated;
                drop(inner);
                self.emit(AuthEvent::TokenRefreshed);
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed");
                inner.state = previous_state;
                RefreshOutcome::Failed
            }
        }
    }

    /// Clear both identity namespaces and forget the current user
    pub fn logout(&self) {
        self.end_session(LogoutReason::UserRequested);
    }

    /// Send an authenticated request for `kind`.
    ///
    /// A session that cannot be recovered from a 401 is logged out before
    /// the error is returned.
    pub async fn request<F>(&self, kind: IdentityKind, build: F) -> Result<Response, AuthError>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        match self.send_authorized(kind, build).await {
            Err(e) if e.is_session_fatal() => {
                self.end_session(LogoutReason::SessionExpired);
                Err(e)
            }
            other => other,
        }
    }

    /// Attach the bearer token, refreshing and retrying at most once on 401
    async fn send_authorized<F>(&self, kind: IdentityKind, build: F) -> Result<Response, AuthError>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let mut retries_left = MAX_AUTH_RETRIES;

        loop {
            let token = self
                .store
                .access_token(kind)
                .ok_or(AuthError::NotAuthenticated)?;

            tracing::debug!(kind = %kind, token = token_prefix(&token), "Sending authorized request");
            let response = build(&self.client, &token).send().await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            tracing::warn!(kind = %kind, "Received 401, access token rejected");

            // Client tokens have no refresh path
            if kind != IdentityKind::Developer || retries_left == 0 {
                return Err(AuthError::SessionExpired);
            }
            retries_left -= 1;

            match self.refresh_developer().await {
                RefreshOutcome::Refreshed => {}
                RefreshOutcome::Failed => return Err(AuthError::RefreshFailed),
                RefreshOutcome::Superseded => return Err(AuthError::Cancelled),
            }
            tracing::debug!("Retrying request with refreshed token");
        }
    }

    fn begin_login_attempt(&self, kind: IdentityKind) -> LoginAttempt {
        let mut inner = self.inner();
        inner.attempts[slot(kind)] += 1;
        LoginAttempt {
            attempt: inner.attempts[slot(kind)],
            epoch: inner.epoch(kind),
        }
    }

    /// Persist a freshly issued session unless a newer login or a logout
    /// happened since the attempt started
    fn establish(&self, attempt: LoginAttempt, session: Session) -> Result<(), AuthError> {
        let kind = session.kind;
        {
            let mut inner = self.inner();
            if inner.attempts[slot(kind)] != attempt.attempt || inner.epoch(kind) != attempt.epoch {
                tracing::warn!(kind = %kind, "Discarding login that resolved after it was superseded");
                return Err(AuthError::Cancelled);
            }
            self.store.write(&session).map_err(AuthError::Storage)?;
            // Work in flight for the replaced session must not commit
            inner.epochs[slot(kind)] += 1;
            inner.user = Some(session.user);
            inner.state = SessionState::Authenticated;
        }

        tracing::info!(
            kind = %kind,
            token = token_prefix(&session.access_token),
            "Login successful"
        );
        self.emit(AuthEvent::LoggedIn { kind });
        Ok(())
    }

    fn end_session(&self, reason: LogoutReason) {
        {
            let mut inner = self.inner();
            for epoch in inner.epochs.iter_mut() {
                *epoch += 1;
            }
            for kind in IdentityKind::ALL {
                if let Err(e) = self.store.clear(kind) {
                    tracing::error!(kind = %kind, error = %e, "Failed to clear credentials");
                }
            }
            inner.user = None;
            inner.state = SessionState::Anonymous;
        }

        match reason {
            LogoutReason::UserRequested => tracing::info!("Logged out"),
            _ => tracing::warn!(reason = ?reason, "Session ended - please log in again"),
        }
        self.emit(AuthEvent::LoggedOut { reason });
    }
}

/// Turn a login response into its payload or a caller-facing error
async fn read_login_response(response: Response) -> Result<LoginResponse, AuthError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<MessageBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| "Login failed".to_string());

        tracing::warn!(status = status.as_u16(), message = %message, "Login rejected");

        return Err(if status.is_client_error() {
            AuthError::CredentialsInvalid(message)
        } else {
            AuthError::Upstream {
                status: status.as_u16(),
                message,
            }
        });
    }

    serde_json::from_str(&body)
        .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse login response: {}", e)))
}

/// Build an error for a non-2xx response
pub(crate) async fn upstream_error(response: Response) -> AuthError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<MessageBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| AuthError::truncate_body(&body));

    tracing::warn!(status = status, message = %message, "Request failed");
    AuthError::Upstream { status, message }
}
