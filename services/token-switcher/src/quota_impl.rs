//! HTTP-backed quota provider
//!
//! Implements `QuotaProvider` against the usage endpoint. A failed usage query
//! (expired access token, error status, unreadable body, network error) is
//! retried once with a freshly refreshed access token; the rotated token pair
//! is returned so the engine can store it.

use account_auth::{UsageSnapshot, fetch_usage, refresh_token};
use provider::{
    ProviderError, QuotaProvider, QuotaReport, QuotaRequest, QuotaVerdict, RefreshedTokens,
};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

/// Quota provider backed by the usage and token-refresh endpoints.
pub struct UsageQuotaProvider {
    client: reqwest::Client,
    usage_url: String,
    refresh_url: String,
    client_id: String,
}

impl UsageQuotaProvider {
    pub fn new(
        client: reqwest::Client,
        usage_url: String,
        refresh_url: String,
        client_id: String,
    ) -> Self {
        Self {
            client,
            usage_url,
            refresh_url,
            client_id,
        }
    }
}

fn report(usage: UsageSnapshot, refreshed: Option<RefreshedTokens>) -> QuotaReport {
    let ratio = usage.ratio();
    QuotaReport {
        verdict: QuotaVerdict::from_ratio(ratio),
        used_ratio: Some(ratio),
        refreshed,
    }
}

fn provider_error(err: account_auth::Error) -> ProviderError {
    match err {
        account_auth::Error::Http(msg) => ProviderError::Transport(msg),
        account_auth::Error::InvalidCredentials(msg) => ProviderError::Auth(msg),
        other => ProviderError::InvalidResponse(other.to_string()),
    }
}

impl QuotaProvider for UsageQuotaProvider {
    fn id(&self) -> &str {
        "usage-api"
    }

    fn query<'a>(
        &'a self,
        request: QuotaRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = provider::Result<QuotaReport>> + Send + 'a>> {
        Box::pin(async move {
            let first = match fetch_usage(&self.client, &self.usage_url, request.access_token).await
            {
                Ok(usage) => return Ok(report(usage, None)),
                Err(e) => e,
            };
            debug!(
                credential_id = request.credential_id,
                error = %first,
                "usage query failed, refreshing access token"
            );

            let tokens = refresh_token(
                &self.client,
                &self.refresh_url,
                &self.client_id,
                request.refresh_token,
            )
            .await
            .map_err(provider_error)?;
            let refreshed = RefreshedTokens {
                access_token: tokens.access_token,
                refresh_token: tokens
                    .refresh_token
                    .unwrap_or_else(|| request.refresh_token.clone()),
            };
            info!(credential_id = request.credential_id, "access token refreshed");

            let usage = fetch_usage(&self.client, &self.usage_url, &refreshed.access_token)
                .await
                .map_err(provider_error)?;
            Ok(report(usage, Some(refreshed)))
        })
    }
}
