//! Error types for pool operations

/// Errors from pool and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no accounts available: {0}")]
    NoAccounts(String),

    #[error("account store error: {0}")]
    Store(String),

    #[error("account not found: {0}")]
    NotFound(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
