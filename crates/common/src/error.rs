//! Configuration error types

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_includes_context() {
        let err = Error::Config("retry.max_attempts must be greater than 0".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: retry.max_attempts must be greater than 0"
        );
    }

    #[test]
    fn io_error_converts_via_from() {
        fn open_missing() -> Result<String> {
            Ok(std::fs::read_to_string("/nonexistent/orchids-proxy.toml")?)
        }
        let err = open_missing().unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got: {err:?}");
        assert!(err.to_string().starts_with("I/O error:"));
    }

    #[test]
    fn toml_error_converts_via_from() {
        fn parse() -> Result<toml::Table> {
            Ok(toml::from_str("[proxy\nlisten_addr =")?)
        }
        let err = parse().unwrap_err();
        assert!(matches!(err, Error::Toml(_)), "got: {err:?}");
    }
}
