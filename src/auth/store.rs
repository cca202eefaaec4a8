// Credential store
// Typed, per-identity view over a durable string key/value backend

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;

use super::error::AuthError;
use super::profile::UserProfile;
use super::types::{IdentityKind, Session};

/// Durable string key/value storage (the localStorage equivalent)
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory backend, used in tests and for throwaway sessions
#[derive(Default, Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Session persistence scoped per identity kind
///
/// The store never tracks expiry. An expired token is only discovered when
/// a protected call comes back with 401.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Store backed by a fresh [`MemoryStore`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Persist a full session into its identity namespace
    pub fn write(&self, session: &Session) -> Result<()> {
        let keys = session.kind.keys();
        let user_json =
            serde_json::to_string(&session.user).context("Failed to serialize user profile")?;

        self.backend
            .set(keys.access_token, &session.access_token)
            .with_context(|| format!("Failed to store {} access token", session.kind))?;

        if let Some(refresh_key) = keys.refresh_token {
            match session.refresh_token {
                Some(ref refresh_token) => self.backend.set(refresh_key, refresh_token)?,
                None => self.backend.remove(refresh_key)?,
            }
        }

        self.backend
            .set(keys.user, &user_json)
            .with_context(|| format!("Failed to store {} user profile", session.kind))?;

        tracing::debug!(kind = %session.kind, "Session written to credential store");
        Ok(())
    }

    /// Load a session, or `None` if there is no usable one.
    ///
    /// A user entry that fails to parse is removed and reported as absent.
    /// Backend failures are logged and also reported as absent.
    pub fn read(&self, kind: IdentityKind) -> Option<Session> {
        let keys = kind.keys();

        let access_token = self.get_logged(keys.access_token)?;
        let user_text = self.get_logged(keys.user)?;

        let user: UserProfile = match serde_json::from_str(&user_text) {
            Ok(user) => user,
            Err(e) => {
                let err = AuthError::CorruptedLocalState(format!("{} profile: {}", kind, e));
                tracing::warn!(error = %err, "Removing unreadable stored profile");
                if let Err(e) = self.backend.remove(keys.user) {
                    tracing::error!(kind = %kind, error = %e, "Failed to remove corrupted profile");
                }
                return None;
            }
        };

        let refresh_token = keys.refresh_token.and_then(|key| self.get_logged(key));

        Some(Session {
            kind,
            access_token,
            refresh_token,
            user,
        })
    }

    /// Remove every key of an identity namespace
    pub fn clear(&self, kind: IdentityKind) -> Result<()> {
        let keys = kind.keys();
        self.backend.remove(keys.access_token)?;
        if let Some(refresh_key) = keys.refresh_token {
            self.backend.remove(refresh_key)?;
        }
        self.backend.remove(keys.user)?;
        tracing::debug!(kind = %kind, "Credential namespace cleared");
        Ok(())
    }

    pub fn access_token(&self, kind: IdentityKind) -> Option<String> {
        self.get_logged(kind.keys().access_token)
    }

    pub fn has_access_token(&self, kind: IdentityKind) -> bool {
        self.access_token(kind).is_some()
    }

    pub fn refresh_token(&self, kind: IdentityKind) -> Option<String> {
        kind.keys().refresh_token.and_then(|key| self.get_logged(key))
    }

    /// Overwrite only the access token (after a refresh)
    pub fn set_access_token(&self, kind: IdentityKind, token: &str) -> Result<()> {
        self.backend
            .set(kind.keys().access_token, token)
            .with_context(|| format!("Failed to update {} access token", kind))
    }

    /// Overwrite only the user profile (after a profile fetch)
    pub fn set_user(&self, kind: IdentityKind, user: &UserProfile) -> Result<()> {
        let user_json = serde_json::to_string(user).context("Failed to serialize user profile")?;
        self.backend
            .set(kind.keys().user, &user_json)
            .with_context(|| format!("Failed to update {} user profile", kind))
    }

    fn get_logged(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Credential store read failed");
                None
            }
        }
    }
}
