//! Sink adapters
//!
//! A sink accepts whole batches and reports per-batch success or failure.
//! Every dispatch worker owns its own sink instance, created through a
//! [`SinkFactory`], so connections and HTTP clients are never shared.
//!
//! # Implementations
//!
//! - [`postgres::PostgresSink`]: one transaction per batch with upserts
//! - [`http::HttpBulkSink`]: one POST per batch to the bulk endpoint
//! - [`memory::MemorySink`]: in-process store used for dry runs
//!
//! The FoodData Central portions stage writes through [`PortionStore`]
//! instead: it only adds measurements to foods that are already stored.

pub mod http;
pub mod memory;
pub mod postgres;

use crate::batch::Batch;
use crate::error::SinkError;
use crate::match_cache::MatchCache;
use crate::record::{Measurement, NaturalKey, SinkId};
use async_trait::async_trait;
use std::collections::HashMap;

/// What a successful batch write did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReceipt {
    /// Canonical identities created by this write
    pub created: Vec<(NaturalKey, SinkId)>,
    /// Records attached to a food that already existed
    pub matched: usize,
}

/// Destination for batches
#[async_trait]
pub trait Sink: Send {
    /// Write `batch` as one unit.
    ///
    /// `matches` resolves natural keys to existing identities. Implementations
    /// only read from it; the dispatcher records [`BatchReceipt::created`]
    /// once the write has succeeded.
    async fn write_batch(&mut self, batch: &Batch, matches: &MatchCache) -> Result<BatchReceipt, SinkError>;
}

/// Creates one sink per dispatch worker
#[async_trait]
pub trait SinkFactory: Send + Sync {
    type Sink: Sink + 'static;

    fn name(&self) -> &'static str;

    async fn connect(&self, worker: usize) -> Result<Self::Sink, SinkError>;
}

/// Store the portions stage attaches measurements to
#[async_trait]
pub trait PortionStore: Send {
    fn name(&self) -> &'static str;

    /// Identity of the stored food for each of `source_ids`; unknown ids are left out
    async fn food_ids(&mut self, source_ids: &[String]) -> Result<HashMap<String, SinkId>, SinkError>;

    /// Add `portions` as one unit, keeping any abbreviation a food already
    /// has. Returns the number of measurements added.
    async fn attach(&mut self, portions: &[(SinkId, Measurement)]) -> Result<u64, SinkError>;
}
