// Token refresh call against the automation platform

use reqwest::Client;

use super::error::AuthError;
use super::types::{MessageBody, RefreshRequest, RefreshResponse};

/// Show only a short prefix of a token in logs
pub(crate) fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

/// Exchange a refresh token for a new access token
pub async fn request_new_access_token(
    client: &Client,
    url: &str,
    email_id: &str,
    refresh_token: &str,
) -> Result<String, AuthError> {
    tracing::info!("Refreshing developer access token...");
    tracing::debug!(
        url = url,
        email = email_id,
        refresh_token = token_prefix(refresh_token),
        "Refresh request"
    );

    let request = RefreshRequest {
        email_id,
        refresh_token,
    };

    let response = client.post(url).json(&request).send().await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<MessageBody>(&error_text)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| AuthError::truncate_body(&error_text));

        tracing::warn!(
            status = status.as_u16(),
            message = %message,
            "Token refresh rejected"
        );
        return Err(AuthError::RefreshFailed);
    }

    let data: RefreshResponse = response.json().await.map_err(|e| {
        AuthError::InvalidResponse(format!("Failed to parse refresh response: {}", e))
    })?;

    if data.access_token.is_empty() {
        return Err(AuthError::InvalidResponse(
            "Refresh response does not contain accessToken".to_string(),
        ));
    }

    tracing::info!(
        token = token_prefix(&data.access_token),
        "Access token refreshed"
    );

    Ok(data.access_token)
}
