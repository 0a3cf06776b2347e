//! Service-specific error types

use axum::http::StatusCode;
use thiserror::Error;

/// Request failures that happen before any response bytes are sent.
///
/// Once streaming has begun, upstream failures never surface as errors: the
/// orchestrator retries and then finalizes the message normally.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no accounts available")]
    NoAccounts,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NoAccounts => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Claude API error `type` string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::NoAccounts => "overloaded_error",
            Error::InvalidRequest(_) => "invalid_request_error",
            Error::Internal(_) => "api_error",
        }
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
