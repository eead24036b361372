//! Usage endpoint client
//!
//! Reads the organisation allowance for the account behind an access token.
//! Expected body: `{"usage": {"standard": {"totalAllowance": N, "orgTotalTokensUsed": M}}}`.

use common::Secret;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Allowance figures for one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub total: u64,
    pub used: u64,
}

impl UsageSnapshot {
    /// Used fraction of the allowance. A zero allowance reads as unused.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64
        }
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

#[derive(Deserialize)]
struct UsageBody {
    usage: UsageSection,
}

#[derive(Deserialize)]
struct UsageSection {
    #[serde(default)]
    standard: StandardUsage,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StandardUsage {
    #[serde(default)]
    total_allowance: u64,
    #[serde(default)]
    org_total_tokens_used: u64,
}

/// Fetch the current usage for an access token.
pub async fn fetch_usage(
    client: &reqwest::Client,
    endpoint: &str,
    access: &Secret<String>,
) -> Result<UsageSnapshot> {
    let response = client
        .get(endpoint)
        .bearer_auth(access.expose())
        .send()
        .await
        .map_err(|e| Error::Http(format!("usage request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "usage endpoint rejected access token ({status}): {body}"
            )));
        }
        return Err(Error::UsageResponse(format!(
            "usage endpoint returned {status}: {body}"
        )));
    }

    let body = response
        .json::<UsageBody>()
        .await
        .map_err(|e| Error::UsageResponse(format!("invalid usage body: {e}")))?;

    Ok(UsageSnapshot {
        total: body.usage.standard.total_allowance,
        used: body.usage.standard.org_total_tokens_used,
    })
}
