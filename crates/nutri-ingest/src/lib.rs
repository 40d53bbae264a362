//! Nutri Ingest Library
//!
//! Streaming bulk ingestion of nutrition datasets into the food database,
//! the food API and the search index.
//!
//! # Overview
//!
//! - **Source**: chunked, lazy reading of large delimited files ([`source`])
//! - **Normalization**: pure per-dataset row mapping ([`normalize`])
//! - **Matching**: natural-key deduplication across the run ([`match_cache`])
//! - **Dispatch**: bounded concurrent batch writes with retry ([`dispatch`])
//! - **Sinks**: PostgreSQL, bulk HTTP API, in-memory ([`sink`])
//! - **Search**: index rebuild through the `_bulk` API ([`search_index`])
//! - **Portions**: FoodData Central household portions for stored foods ([`portions`])
//! - **Maintenance**: merging foods that share a natural key ([`dedup`])
//!
//! # Example
//!
//! ```no_run
//! use nutri_ingest::config::PipelineSettings;
//! use nutri_ingest::normalize::{MyFoodDataNormalizer, Normalizer};
//! use nutri_ingest::pipeline::{open_source, Pipeline};
//! use nutri_ingest::sink::memory::MemorySinkFactory;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = PipelineSettings::default();
//! let normalizer: Arc<dyn Normalizer> = Arc::new(MyFoodDataNormalizer::new()?);
//! let source = open_source("myfooddata.csv", normalizer.as_ref(), &settings, None)?;
//! let report = Pipeline::new(settings)
//!     .run(source, normalizer, &MemorySinkFactory::default())
//!     .await?;
//! println!("{} rows written", report.totals.rows_succeeded);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod accounting;
pub mod batch;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod match_cache;
pub mod normalize;
pub mod pipeline;
pub mod portions;
pub mod progress;
pub mod record;
pub mod search_index;
pub mod sink;
pub mod source;

// Re-export commonly used types
pub use error::{ConfigError, IndexError, SinkError, SourceError};
pub use pipeline::{Pipeline, RunReport, RunStatus};
pub use record::{NaturalKey, NormalizedRecord, SinkId};

use clap::{Args, Parser, Subcommand, ValueEnum};
use config::PipelineSettings;
use std::path::PathBuf;

/// Nutri Ingest - bulk loader for nutrition datasets
#[derive(Parser, Debug)]
#[command(name = "nutri-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load the MyFoodData CSV export into the database
    #[command(name = "myfooddata")]
    MyFoodData {
        /// Path to the CSV export
        #[arg(long)]
        file: PathBuf,

        /// Lines above the header row (defaults to the export's preamble)
        #[arg(long)]
        skip_rows: Option<usize>,

        /// Normalize and batch without writing anywhere
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Load an OpenFoodFacts TSV dump
    #[command(name = "openfoodfacts")]
    OpenFoodFacts {
        /// Path to the tab-separated dump
        #[arg(long)]
        file: PathBuf,

        /// Destination of the records
        #[arg(long, value_enum, default_value_t = SinkKind::Http)]
        sink: SinkKind,

        /// Food API base URL (overrides API_BASE_URL)
        #[arg(long)]
        api_url: Option<String>,

        /// Bearer token for the food API (overrides API_TOKEN)
        #[arg(long)]
        token: Option<String>,

        /// Normalize and batch without writing anywhere
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Load a FoodData Central CSV release: foods, then their portions
    #[command(name = "fdc")]
    Fdc {
        /// Directory holding the release's CSV files
        #[arg(long)]
        dir: PathBuf,

        /// Which part of the release to load
        #[arg(long, value_enum, default_value_t = FdcStage::All)]
        stage: FdcStage,

        /// Normalize and batch without writing anywhere
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Merge foods that share a name and calorie count into the oldest one
    MergeDuplicates {
        /// Report the groups without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Create or update the food tables
    Migrate,

    /// Rebuild the food search index from the database
    Reindex {
        /// Search cluster URL (overrides ES_URL)
        #[arg(long)]
        es_url: Option<String>,

        /// Index name (overrides ES_FOOD_INDEX)
        #[arg(long)]
        index: Option<String>,
    },
}

/// Where ingested records are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Bulk endpoint of the food API
    Http,
    /// PostgreSQL food tables
    Database,
}

/// Stages of a FoodData Central load
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FdcStage {
    /// Foods, then portions
    All,
    /// Foods and their nutrients only
    Foods,
    /// Portions of foods already loaded
    Portions,
}

impl FdcStage {
    pub fn includes_foods(self) -> bool {
        matches!(self, FdcStage::All | FdcStage::Foods)
    }

    pub fn includes_portions(self) -> bool {
        matches!(self, FdcStage::All | FdcStage::Portions)
    }
}

/// Run tuning flags; unset flags keep the environment or default value
#[derive(Args, Debug, Clone, Default)]
pub struct PipelineArgs {
    /// Records per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Concurrent sink workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Batches queued or in flight before the reader waits
    #[arg(long)]
    pub max_inflight: Option<usize>,

    /// Retries of a batch after transient failures
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Delay before the first retry, doubled on each further retry
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Rows read from disk at a time
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Stop after this many data rows
    #[arg(long)]
    pub max_rows: Option<u64>,

    /// Seconds between progress log lines
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,

    /// Error messages kept for the final report
    #[arg(long)]
    pub max_error_examples: Option<usize>,
}

impl PipelineArgs {
    /// Override `settings` with every flag that was given
    pub fn apply(&self, mut settings: PipelineSettings) -> Result<PipelineSettings, ConfigError> {
        if let Some(v) = self.batch_size {
            settings.batch_size = v;
        }
        if let Some(v) = self.workers {
            settings.workers = v;
        }
        if let Some(v) = self.max_inflight {
            settings.max_inflight = v;
        }
        if let Some(v) = self.max_retries {
            settings.max_retries = v;
        }
        if let Some(v) = self.retry_backoff_ms {
            settings.retry_backoff_ms = v;
        }
        if let Some(v) = self.chunk_size {
            settings.chunk_size = v;
        }
        if self.max_rows.is_some() {
            settings.max_rows = self.max_rows;
        }
        if let Some(v) = self.heartbeat_secs {
            settings.heartbeat_secs = v;
        }
        if let Some(v) = self.max_error_examples {
            settings.max_error_examples = v;
        }
        settings.validate()?;
        Ok(settings)
    }
}
