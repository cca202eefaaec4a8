// Authentication module
// Session persistence, login/refresh/logout handshake and the route guard

mod error;
mod guard;
mod profile;
mod refresh;
mod service;
mod sqlite;
mod store;
mod types;

pub use error::AuthError;
pub use guard::{GuardDecision, RouteGuard, LOGIN_PATH};
pub use profile::UserProfile;
pub use service::{AuthEndpoints, AuthService};
pub use sqlite::SqliteStore;
pub use store::{CredentialStore, KeyValueStore, MemoryStore};
pub use types::{AuthEvent, IdentityKind, LogoutReason, Session, SessionState, StorageKeys};

pub(crate) use service::{join_url, upstream_error};
