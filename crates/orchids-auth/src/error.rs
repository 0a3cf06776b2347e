//! Error types for token operations

/// Errors from token exchange.
///
/// `Clone` because one deduplicated fetch outcome is handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("token response parse error: {0}")]
    TokenParse(String),
}

/// Result alias for token operations.
pub type Result<T> = std::result::Result<T, Error>;
