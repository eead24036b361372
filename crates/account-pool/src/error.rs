//! Error types for pool operations

use std::time::Duration;

/// Errors from the credential store, the switch coordinator and the background loops.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential {0} is active and cannot be deleted; switch away from it first")]
    NotDeletable(String),

    #[error("credential {0} has no remaining quota")]
    Exhausted(String),

    #[error("no usable credential left in the pool")]
    NoCandidate,

    #[error("quota endpoint error: {0}")]
    Transport(String),

    #[error("malformed import record: {0}")]
    Malformed(String),

    #[error("persisting credentials failed: {0}")]
    Persistence(String),

    #[error("switch lock not acquired within {}ms", .0.as_millis())]
    LockTimeout(Duration),
}

impl Error {
    /// Stable label for metrics and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::NotDeletable(_) => "not_deletable",
            Error::Exhausted(_) => "exhausted",
            Error::NoCandidate => "no_candidate",
            Error::Transport(_) => "transport",
            Error::Malformed(_) => "malformed",
            Error::Persistence(_) => "persistence",
            Error::LockTimeout(_) => "lock_timeout",
        }
    }
}

impl From<account_auth::Error> for Error {
    fn from(err: account_auth::Error) -> Self {
        match err {
            account_auth::Error::Malformed(msg) => Error::Malformed(msg),
            account_auth::Error::Http(_)
            | account_auth::Error::InvalidCredentials(_)
            | account_auth::Error::UsageResponse(_)
            | account_auth::Error::TokenRefresh(_) => Error::Transport(err.to_string()),
            account_auth::Error::CredentialParse(_) | account_auth::Error::Io(_) => {
                Error::Persistence(err.to_string())
            }
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
