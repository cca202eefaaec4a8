// User accounts for the backend
// Accounts live in memory for the lifetime of the server process. Passwords
// are stored as Argon2id hashes and every outward representation has
// `password: null`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;

/// Minimum password length accepted on signup
const MIN_PASSWORD_LENGTH: usize = 6;

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// Stored account
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: u64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password_hash: String,
    pub status: String,
    pub role_display_name: String,
    pub master_role_id: i64,
    pub active_project: i64,
    pub projects: String,
    pub project_name: String,
    /// Currently valid refresh token, if any
    pub refresh_token: Option<String>,
}

impl UserRecord {
    /// Wire representation shared by login and profile endpoints
    pub fn to_profile_json(&self) -> Value {
        json!({
            "userID": self.user_id,
            "emailID": self.email,
            "password": null,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "status": self.status,
            "otp": null,
            "newdata": null,
            "roleDisplayName": self.role_display_name,
            "projects": self.projects,
            "masterRoleID": self.master_role_id,
            "activeProject": self.active_project,
            "projectName": self.project_name,
        })
    }
}

/// Signup payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

impl NewUser {
    /// Check required fields and the password length
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() {
            return Err(ApiError::ValidationError(
                "First and last name are required".to_string(),
            ));
        }
        if !EMAIL_PATTERN.is_match(self.email.trim()) {
            return Err(ApiError::ValidationError("A valid email is required".to_string()));
        }
        validate_password(&self.password)
    }
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::ValidationError(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

/// Hash a password with Argon2id and a random salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("Password hashing failed: {e}"))
}

/// Check a password against a stored hash; `Ok(false)` on mismatch
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| anyhow!("Invalid password hash: {e}"))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow!("Password verification failed: {e}")),
    }
}

/// Thread-safe account store keyed by lowercase email
#[derive(Clone, Default)]
pub struct UserRepository {
    by_email: Arc<DashMap<String, UserRecord>>,
    next_id: Arc<AtomicU64>,
}

impl UserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new account; duplicate emails are rejected
    pub fn create(&self, new_user: &NewUser) -> std::result::Result<UserRecord, ApiError> {
        new_user.validate()?;

        let email = normalize_email(&new_user.email);
        let password_hash = hash_password(&new_user.password)?;

        match self.by_email.entry(email.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ApiError::ValidationError(
                "User already exists".to_string(),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let record = UserRecord {
                    user_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                    first_name: new_user.first_name.trim().to_string(),
                    last_name: new_user.last_name.trim().to_string(),
                    email,
                    password_hash,
                    status: "Y".to_string(),
                    role_display_name: "User".to_string(),
                    master_role_id: 0,
                    active_project: 0,
                    projects: "General".to_string(),
                    project_name: "General".to_string(),
                    refresh_token: None,
                };
                slot.insert(record.clone());
                tracing::info!(user_id = record.user_id, email = %record.email, "User registered");
                Ok(record)
            }
        }
    }

    pub fn find_by_email(&self, email: &str) -> Option<UserRecord> {
        self.by_email
            .get(&normalize_email(email))
            .map(|entry| entry.value().clone())
    }

    pub fn find_by_id(&self, user_id: u64) -> Option<UserRecord> {
        self.by_email
            .iter()
            .find(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
    }

    /// Record the refresh token issued at login (replaces any previous one)
    pub fn set_refresh_token(&self, email: &str, token: Option<String>) -> bool {
        match self.by_email.get_mut(&normalize_email(email)) {
            Some(mut entry) => {
                entry.refresh_token = token;
                true
            }
            None => false,
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
