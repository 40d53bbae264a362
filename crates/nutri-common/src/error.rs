//! Error types shared by the ingestion crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while reading configuration or setting up logging
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing required settings: {}", .0.join(", "))]
    MissingSettings(Vec<String>),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidSetting { key: String, value: String },

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl CommonError {
    pub fn invalid(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            value: value.into(),
        }
    }
}
