//! Token refresh
//!
//! Exchanges a refresh token for a new access token. Used by the quota probe
//! when the stored access token has expired and the usage query fails.

use common::Secret;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Response from the token endpoint.
///
/// The endpoint may or may not rotate the refresh token; when it does not,
/// the caller keeps the one it already had.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
}

/// Refresh an access token using a refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    endpoint: &str,
    client_id: &str,
    refresh: &Secret<String>,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh.expose().as_str()),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 400/401/403 means the refresh token is revoked or invalid
        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenRefresh(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenRefresh(format!("invalid refresh response: {e}")))?;

    if token.access_token.expose().trim().is_empty() {
        return Err(Error::TokenRefresh(
            "refresh response carried an empty access token".into(),
        ));
    }
    Ok(token)
}
