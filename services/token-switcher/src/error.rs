//! Admin API error responses
//!
//! Engine errors surface to the operator as JSON bodies with a stable `kind`
//! label and an HTTP status that matches the failure class.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// An engine error on its way out of an admin handler.
#[derive(Debug)]
pub struct ApiError(pub account_pool::Error);

impl From<account_pool::Error> for ApiError {
    fn from(err: account_pool::Error) -> Self {
        Self(err)
    }
}

/// HTTP status for an engine error.
pub fn status_for(err: &account_pool::Error) -> StatusCode {
    use account_pool::Error;
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::NotDeletable(_) | Error::Exhausted(_) | Error::NoCandidate => StatusCode::CONFLICT,
        Error::Malformed(_) => StatusCode::BAD_REQUEST,
        Error::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Transport(_) => StatusCode::BAD_GATEWAY,
        Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (
            status_for(&self.0),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
