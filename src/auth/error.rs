use thiserror::Error;

/// Errors surfaced by the session layer
#[derive(Error, Debug)]
pub enum AuthError {
    /// Login rejected by the server (user-correctable)
    #[error("Login failed: {0}")]
    CredentialsInvalid(String),

    /// Protected call returned 401 and the session could not be recovered
    #[error("Session expired - please log in again")]
    SessionExpired,

    /// Refresh endpoint rejected the refresh token or was unreachable
    #[error("Token refresh failed")]
    RefreshFailed,

    /// Stored profile could not be parsed
    #[error("Stored session data is corrupted: {0}")]
    CorruptedLocalState(String),

    /// Transport-level failure
    #[error("Network error: {0}")]
    NetworkUnavailable(#[from] reqwest::Error),

    /// No stored credential for the requested identity
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Non-2xx response that is not an auth failure
    #[error("Server error: {status} - {message}")]
    Upstream { status: u16, message: String },

    /// Response did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Login resolved after it was superseded by a logout or a newer login
    #[error("Login attempt was cancelled")]
    Cancelled,

    /// Credential store backend failure
    #[error("Credential storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }

    /// Whether this error ends the current session
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AuthError::SessionExpired | AuthError::RefreshFailed | AuthError::NotAuthenticated
        )
    }
}
