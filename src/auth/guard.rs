// Protected route guard

use super::profile::UserProfile;
use super::store::CredentialStore;
use super::types::IdentityKind;

/// Where unauthenticated navigation is sent
pub const LOGIN_PATH: &str = "/login";

/// Outcome of a guard check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Render,
    Redirect { to: &'static str },
}

impl GuardDecision {
    pub fn is_allowed(self) -> bool {
        self == GuardDecision::Render
    }
}

/// Render-or-redirect gate evaluated on each protected navigation.
///
/// Pure: no network calls and no refresh. A user counts as authenticated
/// if a profile is loaded in memory or if either identity has a stored
/// access token.
pub struct RouteGuard;

impl RouteGuard {
    pub fn check(user: Option<&UserProfile>, store: &CredentialStore) -> GuardDecision {
        let authenticated = user.is_some()
            || IdentityKind::ALL
                .iter()
                .any(|kind| store.has_access_token(*kind));

        if authenticated {
            GuardDecision::Render
        } else {
            GuardDecision::Redirect { to: LOGIN_PATH }
        }
    }
}
