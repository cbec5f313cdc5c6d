//! Error types shared across Sluice crates

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Errors that are not specific to a single crate
#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl SluiceError {
    /// Configuration error naming the offending environment variable
    pub fn invalid_env(var: &str, value: &str, expected: &str) -> Self {
        Self::Config(format!("{var}={value:?} is invalid, expected {expected}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_env_message() {
        let err = SluiceError::invalid_env("INGEST_MAX_JOBS", "zero", "a positive integer");
        assert_eq!(
            err.to_string(),
            "Configuration error: INGEST_MAX_JOBS=\"zero\" is invalid, expected a positive integer"
        );
    }
}
