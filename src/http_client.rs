use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::auth::{join_url, upstream_error, AuthError, AuthService, IdentityKind};

/// JSON client for the automation platform's protected endpoints
/// (connections, comparisons, schedules).
///
/// Every call goes through [`AuthService::request`], so a 401 gets one
/// refresh-and-retry and an unrecoverable session is logged out.
#[derive(Clone)]
pub struct AutomatorClient {
    auth: Arc<AuthService>,
    base_url: String,
    kind: IdentityKind,
}

impl AutomatorClient {
    pub fn new(auth: Arc<AuthService>, base_url: impl Into<String>, kind: IdentityKind) -> Self {
        Self {
            auth,
            base_url: base_url.into(),
            kind,
        }
    }

    /// Client for the automation platform using the configured endpoints
    pub fn for_automator(auth: Arc<AuthService>, kind: IdentityKind) -> Self {
        let base_url = auth.endpoints().automator_url.clone();
        Self::new(auth, base_url, kind)
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    /// POST a JSON body to `path` and decode the JSON response
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = join_url(&self.base_url, path);
        tracing::debug!(method = %method, url = %url, kind = %self.kind, "Automator request");

        let response = self
            .auth
            .request(self.kind, |client, token| {
                let builder = client.request(method.clone(), &url).bearer_auth(token);
                match body {
                    Some(body) => builder.json(body),
                    None => builder,
                }
            })
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse {}: {}", url, e)))
    }
}
