//! Error types for credential files and remote endpoints

/// Errors from credential storage, import parsing and HTTP calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("usage response error: {0}")]
    UsageResponse(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("malformed import record: {0}")]
    Malformed(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
