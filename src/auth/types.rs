// Authentication types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::profile::UserProfile;

/// Which identity a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// Issued by our own backend (`/api/auth/login`), refreshable
    Developer,

    /// Issued directly by the automation platform (`authenticateUser`), no refresh path
    Client,
}

impl IdentityKind {
    pub const ALL: [IdentityKind; 2] = [IdentityKind::Developer, IdentityKind::Client];

    /// Storage keys for this identity's namespace
    pub fn keys(self) -> StorageKeys {
        match self {
            IdentityKind::Developer => StorageKeys {
                access_token: "token",
                refresh_token: Some("refreshToken"),
                user: "user",
            },
            IdentityKind::Client => StorageKeys {
                access_token: "clientToken",
                refresh_token: None,
                user: "clientUser",
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::Developer => "developer",
            IdentityKind::Client => "client",
        }
    }
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key names used by one identity namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageKeys {
    pub access_token: &'static str,
    pub refresh_token: Option<&'static str>,
    pub user: &'static str,
}

/// An authenticated session as persisted in the credential store
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub kind: IdentityKind,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: UserProfile,
}

/// Lifecycle state of the auth service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
    Refreshing,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// Explicit logout by the user
    UserRequested,
    /// Token rejected and could not be refreshed
    SessionExpired,
    /// Canonical profile could not be loaded
    ProfileUnavailable,
}

/// Notifications for the UI layer (navigation, toasts)
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    LoggedIn { kind: IdentityKind },
    ProfileUpdated,
    TokenRefreshed,
    LoggedOut { reason: LogoutReason },
}

/// Backend login request
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Automation platform login request
#[derive(Serialize)]
pub struct AuthenticateUserRequest<'a> {
    #[serde(rename = "EmailID")]
    pub email_id: &'a str,
    #[serde(rename = "Password")]
    pub password: &'a str,
}

/// Login response from either backend; `user` is an object or an array
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Value,
}

/// `GET /api/getUserDetails` response
#[derive(Deserialize)]
pub struct UserDetailsResponse {
    #[serde(default)]
    pub user: Value,
}

/// Refresh endpoint request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    #[serde(rename = "emailID")]
    pub email_id: &'a str,
    pub refresh_token: &'a str,
}

/// Refresh endpoint response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: String,
}

/// Error body shape shared by the backends
#[derive(Deserialize, Default)]
pub struct MessageBody {
    pub message: Option<String>,
}
