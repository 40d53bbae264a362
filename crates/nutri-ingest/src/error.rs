//! Error types for the ingestion pipeline
//!
//! Row-level problems never show up here: the normalizer turns them into
//! skip decisions. What remains are failures of a whole stream, a whole
//! batch or a maintenance step.

use nutri_common::CommonError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while opening or reading a dataset file
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source has no header row")]
    NoHeader,

    #[error("required column(s) missing: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("read failed: {0}")]
    Read(#[from] csv::Error),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    /// A single undecodable row; the stream itself is still usable
    #[error("malformed row at line {line}: {message}")]
    Row { line: u64, message: String },
}

impl SourceError {
    /// Whether the error only affects one row
    pub fn is_row_level(&self) -> bool {
        matches!(self, SourceError::Row { .. })
    }
}

/// Outcome classes of a failed sink write
///
/// The dispatcher only looks at the variant: transient failures are
/// retried with backoff, fatal ones abort the run, rejected batches are
/// counted as failed without retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Rate limiting, 5xx, timeouts, lost connections, serialization conflicts
    #[error("{0}")]
    Transient(String),

    /// Credentials rejected; nothing else will succeed either
    #[error("{0}")]
    Fatal(String),

    /// The batch itself was refused
    #[error("{0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Fatal(_))
    }
}

/// Invalid or incomplete settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] CommonError),

    #[error("{0}")]
    Invalid(String),
}

/// Failures of the search index rebuild
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database read failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{action} returned HTTP {status}: {body}")]
    Status {
        action: &'static str,
        status: u16,
        body: String,
    },

    #[error("bulk request reported item errors: {0}")]
    BulkItems(String),

    #[error("failed to encode documents: {0}")]
    Encode(#[from] serde_json::Error),
}
