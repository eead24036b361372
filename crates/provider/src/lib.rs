//! Quota provider abstraction for the remote usage endpoint
//!
//! Defines the `QuotaProvider` trait that decouples the failover engine from
//! the product-specific usage API. The engine only needs a tri-state answer
//! for a credential: usable, fully depleted, or an error. The HTTP-backed
//! implementation lives in the service binary; tests plug in scripted fakes.

use common::Secret;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Used ratio at or above which a credential counts as fully depleted.
pub const EXHAUSTED_RATIO: f64 = 1.0;

/// Outcome of a successful quota query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaVerdict {
    /// Remaining allowance is available
    Healthy,
    /// Allowance is fully used up
    Exhausted,
}

impl QuotaVerdict {
    /// Map a used/total ratio onto a verdict.
    ///
    /// Anything at or above `EXHAUSTED_RATIO` is exhausted. Negative or NaN
    /// ratios never come from a well-formed response, so they are treated as
    /// healthy and left for the caller to validate.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= EXHAUSTED_RATIO {
            QuotaVerdict::Exhausted
        } else {
            QuotaVerdict::Healthy
        }
    }
}

/// Tokens rotated by the provider while answering a query.
///
/// The provider may refresh an expired access token to complete the query;
/// the caller writes the new pair back so the next query (and the CLI client)
/// uses it.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
}

/// Result of a quota query for one credential.
#[derive(Debug, Clone)]
pub struct QuotaReport {
    pub verdict: QuotaVerdict,
    /// Used fraction of the allowance, when the endpoint reports one
    pub used_ratio: Option<f64>,
    pub refreshed: Option<RefreshedTokens>,
}

impl QuotaReport {
    /// Report with only a verdict (no ratio, no rotated tokens).
    pub fn verdict(verdict: QuotaVerdict) -> Self {
        Self {
            verdict,
            used_ratio: None,
            refreshed: None,
        }
    }
}

/// Token material handed to the provider for a single query.
#[derive(Debug, Clone, Copy)]
pub struct QuotaRequest<'a> {
    pub credential_id: &'a str,
    pub access_token: &'a Secret<String>,
    pub refresh_token: &'a Secret<String>,
}

/// Errors from quota queries. All of them are recoverable: the probe records
/// the credential as `Error` and retries on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid usage response: {0}")]
    InvalidResponse(String),

    #[error("credential rejected: {0}")]
    Auth(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Abstraction over the remote quota endpoint.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn QuotaProvider>`).
pub trait QuotaProvider: Send + Sync {
    /// Identifier for logging (e.g. "usage-api")
    fn id(&self) -> &str;

    /// Query the remaining allowance for one credential.
    fn query<'a>(
        &'a self,
        request: QuotaRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<QuotaReport>> + Send + 'a>>;
}
