// Canonical user profile
// The backends disagree on the shape of a user: our own login returns an
// array, `getUserDetails` returns a bare object, the automation platform
// uses `EmailID` where we use `emailID` or `email`, and numeric fields
// sometimes arrive as strings. Everything is folded into `UserProfile`
// right after the response is decoded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::AuthError;

/// Denormalized snapshot of the authenticated principal.
///
/// There is no password field. Anything the wire sends under
/// `password` is dropped during normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub id: String,
    #[serde(rename = "emailID")]
    pub email_id: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    #[serde(rename = "roleDisplayName")]
    pub role_display_name: Option<String>,
    pub projects: Vec<String>,
    #[serde(rename = "masterRoleID")]
    pub master_role_id: i64,
    #[serde(rename = "activeProject")]
    pub active_project: i64,
    #[serde(rename = "projectName")]
    pub project_name: Option<String>,
}

const ID_KEYS: &[&str] = &["id", "userID", "userId", "UserID", "_id"];
const EMAIL_KEYS: &[&str] = &["emailID", "email", "EmailID", "Email"];
const FIRST_NAME_KEYS: &[&str] = &["firstName", "FirstName", "first_name"];
const LAST_NAME_KEYS: &[&str] = &["lastName", "LastName", "last_name"];
const ROLE_KEYS: &[&str] = &["roleDisplayName", "RoleDisplayName", "role"];
const PROJECTS_KEYS: &[&str] = &["projects", "Projects"];
const MASTER_ROLE_KEYS: &[&str] = &["masterRoleID", "MasterRoleID", "masterRoleId"];
const ACTIVE_PROJECT_KEYS: &[&str] = &["activeProject", "ActiveProject"];
const PROJECT_NAME_KEYS: &[&str] = &["projectName", "ProjectName"];

impl UserProfile {
    /// Normalize a user payload from any backend.
    ///
    /// Accepts a bare object or an array (first element wins).
    pub fn from_wire(value: &Value) -> Result<Self, AuthError> {
        let object = match value {
            Value::Object(map) => map,
            Value::Array(items) => match items.first() {
                Some(Value::Object(map)) => map,
                Some(_) => {
                    return Err(AuthError::InvalidResponse(
                        "user array does not contain an object".to_string(),
                    ))
                }
                None => {
                    return Err(AuthError::InvalidResponse(
                        "user array is empty".to_string(),
                    ))
                }
            },
            Value::Null => {
                return Err(AuthError::InvalidResponse(
                    "response does not contain a user".to_string(),
                ))
            }
            other => {
                return Err(AuthError::InvalidResponse(format!(
                    "unexpected user payload type: {}",
                    json_type(other)
                )))
            }
        };

        Ok(Self {
            id: text(object, ID_KEYS).unwrap_or_default(),
            email_id: text(object, EMAIL_KEYS).unwrap_or_default(),
            first_name: text(object, FIRST_NAME_KEYS).unwrap_or_default(),
            last_name: text(object, LAST_NAME_KEYS).unwrap_or_default(),
            role_display_name: text(object, ROLE_KEYS),
            projects: projects(object),
            master_role_id: integer(object, MASTER_ROLE_KEYS),
            active_project: integer(object, ACTIVE_PROJECT_KEYS),
            project_name: text(object, PROJECT_NAME_KEYS),
        })
    }

    /// Display name for prompts and logs
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.email_id.clone()
        } else {
            full.to_string()
        }
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

fn text(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match lookup(object, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn integer(object: &Map<String, Value>, keys: &[&str]) -> i64 {
    match lookup(object, keys) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn projects(object: &Map<String, Value>) -> Vec<String> {
    match lookup(object, PROJECTS_KEYS) {
        Some(Value::String(s)) => split_names(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(map) => text(map, &["projectName", "name", "ProjectName"]),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|name| !name.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn split_names(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
