//! Settings for ingestion runs and their destinations
//!
//! Every value has a default, can be overridden through the environment
//! (after `.env` has been loaded) and finally by command-line flags.

use crate::accounting::{DEFAULT_HEARTBEAT_SECS, DEFAULT_MAX_ERROR_EXAMPLES};
use crate::batch::DEFAULT_BATCH_SIZE;
use crate::dispatch::{
    DispatchSettings, DEFAULT_MAX_INFLIGHT, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_WORKERS,
};
use crate::error::ConfigError;
use crate::match_cache::DEFAULT_CACHE_CLEAR_THRESHOLD;
use crate::sink::http::{DEFAULT_API_BASE_URL, DEFAULT_API_TIMEOUT_SECS, DEFAULT_BULK_PATH};
use crate::source::DEFAULT_CHUNK_SIZE;
use nutri_common::env;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::time::Duration;

// ============================================================================
// Destination Defaults
// ============================================================================

/// Default PostgreSQL port
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default search cluster URL
pub const DEFAULT_ES_URL: &str = "http://localhost:9200";

/// Default name of the food search index
pub const DEFAULT_ES_FOOD_INDEX: &str = "foods";

/// Default number of documents per `_bulk` request
pub const DEFAULT_ES_BULK_CHUNK: usize = 500;

/// Default search request timeout in seconds
pub const DEFAULT_ES_TIMEOUT_SECS: u64 = 120;

/// Tuning of one ingestion run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub workers: usize,
    pub max_inflight: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub chunk_size: usize,
    pub max_rows: Option<u64>,
    pub heartbeat_secs: u64,
    pub max_error_examples: usize,
    pub cache_clear_threshold: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_rows: None,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            max_error_examples: DEFAULT_MAX_ERROR_EXAMPLES,
            cache_clear_threshold: DEFAULT_CACHE_CLEAR_THRESHOLD,
        }
    }
}

impl PipelineSettings {
    /// Defaults overridden by `INGEST_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let settings = Self {
            batch_size: env::parse_var("INGEST_BATCH_SIZE", defaults.batch_size)?,
            workers: env::parse_var("INGEST_WORKERS", defaults.workers)?,
            max_inflight: env::parse_var("INGEST_MAX_INFLIGHT", defaults.max_inflight)?,
            max_retries: env::parse_var("INGEST_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_ms: env::parse_var("INGEST_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
            chunk_size: env::parse_var("INGEST_CHUNK_SIZE", defaults.chunk_size)?,
            max_rows: env::parse_opt("INGEST_MAX_ROWS")?,
            heartbeat_secs: env::parse_var("INGEST_HEARTBEAT_SECS", defaults.heartbeat_secs)?,
            max_error_examples: env::parse_var("INGEST_MAX_ERROR_EXAMPLES", defaults.max_error_examples)?,
            cache_clear_threshold: env::parse_var("INGEST_CACHE_CLEAR_THRESHOLD", defaults.cache_clear_threshold)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("batch size", self.batch_size),
            ("workers", self.workers),
            ("max in-flight batches", self.max_inflight),
            ("chunk size", self.chunk_size),
            ("cache clear threshold", self.cache_clear_threshold),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }

        if self.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat interval must be greater than 0".into()));
        }

        if self.max_inflight < self.workers {
            return Err(ConfigError::Invalid(format!(
                "max in-flight batches ({}) cannot be less than workers ({})",
                self.max_inflight, self.workers
            )));
        }

        Ok(())
    }

    pub fn dispatch(&self) -> DispatchSettings {
        DispatchSettings {
            workers: self.workers,
            max_inflight: self.max_inflight,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Connection to the food database
///
/// Held as parsed connect options so credentials never pass through a
/// hand-built URL.
#[derive(Clone)]
pub struct DatabaseSettings {
    options: PgConnectOptions,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("target", &self.target())
            .finish()
    }
}

impl DatabaseSettings {
    /// `DATABASE_URL`, or options assembled from the `DB_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Some(url) = env::var("DATABASE_URL") {
            return Self::from_url(&url);
        }

        let values = env::require(&["DB_HOST", "DB_USER", "DB_NAME"])?;
        let port = env::parse_var("DB_PORT", DEFAULT_DB_PORT)?;
        let password = env::var("DB_PASSWORD");

        Ok(Self::from_parts(&values[0], port, &values[1], password.as_deref(), &values[2]))
    }

    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let options = url
            .parse::<PgConnectOptions>()
            .map_err(|e| ConfigError::Invalid(format!("DATABASE_URL is not a valid connection string: {e}")))?;
        Ok(Self { options })
    }

    /// Credentials are passed through verbatim, whatever characters they contain
    pub fn from_parts(host: &str, port: u16, user: &str, password: Option<&str>, database: &str) -> Self {
        let mut options = PgConnectOptions::new()
            .host(host)
            .port(port)
            .username(user)
            .database(database);
        if let Some(password) = password {
            options = options.password(password);
        }
        Self { options }
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }

    /// `user@host:port/database`, safe to log
    pub fn target(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.options.get_username(),
            self.options.get_host(),
            self.options.get_port(),
            self.options.get_database().unwrap_or_default()
        )
    }
}

/// Bulk food API used by the HTTP sink
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSettings {
    pub base_url: String,
    pub bulk_path: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSettings")
            .field("base_url", &self.base_url)
            .field("bulk_path", &self.bulk_path)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            bulk_path: DEFAULT_BULK_PATH.to_string(),
            token: None,
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
        }
    }
}

impl ApiSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            base_url: env::var("API_BASE_URL").unwrap_or(defaults.base_url),
            bulk_path: env::var("API_BULK_PATH").unwrap_or(defaults.bulk_path),
            token: env::var("API_TOKEN"),
            timeout_secs: env::parse_var("API_TIMEOUT_SECS", defaults.timeout_secs)?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Search cluster holding the food index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSettings {
    pub url: String,
    pub index: String,
    pub bulk_chunk: usize,
    pub timeout_secs: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_ES_URL.to_string(),
            index: DEFAULT_ES_FOOD_INDEX.to_string(),
            bulk_chunk: DEFAULT_ES_BULK_CHUNK,
            timeout_secs: DEFAULT_ES_TIMEOUT_SECS,
        }
    }
}

impl SearchSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let settings = Self {
            url: env::var("ES_URL").unwrap_or(defaults.url),
            index: env::var("ES_FOOD_INDEX").unwrap_or(defaults.index),
            bulk_chunk: env::parse_var("ES_BULK_CHUNK", defaults.bulk_chunk)?,
            timeout_secs: env::parse_var("ES_TIMEOUT_SECS", defaults.timeout_secs)?,
        };
        if settings.bulk_chunk == 0 {
            return Err(ConfigError::Invalid("search bulk chunk must be greater than 0".into()));
        }
        Ok(settings)
    }
}
