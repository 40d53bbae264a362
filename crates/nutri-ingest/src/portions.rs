//! FoodData Central portions stage
//!
//! ```text
//! food_portion.csv -> PortionNormalizer --(bounded queue)--> resolve fdc_id -> PortionStore
//!   (blocking reader thread)                                     (one async writer)
//! ```
//!
//! Runs after the food import. Each chunk of portions is resolved to stored
//! foods by source id, then attached in one write. Portions of foods that
//! were never imported are skipped. Resolved ids are cached and the cache is
//! emptied in one go once it passes the clear threshold.

use crate::accounting::{spawn_heartbeat, RunAccounting};
use crate::config::PipelineSettings;
use crate::dispatch::{DispatchResult, DispatchSettings};
use crate::error::{SinkError, SourceError};
use crate::normalize::fdc::{FdcPortion, PortionNormalizer};
use crate::normalize::SkipReason;
use crate::pipeline::{RunReport, RunStatus};
use crate::progress::RunProgress;
use crate::record::{Measurement, SinkId};
use crate::sink::{BatchReceipt, PortionStore};
use crate::source::{CsvSource, RecordSource};
use anyhow::Context;
use chrono::Utc;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Dataset name used in reports
pub const DATASET: &str = "fdc-portions";

pub struct PortionStage {
    settings: PipelineSettings,
    cancel: CancellationToken,
    show_progress: bool,
}

impl PortionStage {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            cancel: CancellationToken::new(),
            show_progress: false,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, visible: bool) -> Self {
        self.show_progress = visible;
        self
    }

    /// Attach every portion in `source` to its food in `store`.
    ///
    /// Like [`Pipeline::run`](crate::pipeline::Pipeline::run), errors are
    /// returned only before the first write.
    pub async fn run<R, S>(
        &self,
        mut source: CsvSource<R>,
        normalizer: Arc<PortionNormalizer>,
        store: &mut S,
    ) -> anyhow::Result<RunReport>
    where
        R: Read + Send + 'static,
        S: PortionStore,
    {
        source
            .check_columns(normalizer.required_columns())
            .context("food_portion.csv is not usable")?;

        let sink = store.name();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(%run_id, dataset = DATASET, sink, chunk = self.settings.batch_size, "Starting portions stage");

        let accounting = Arc::new(RunAccounting::new(self.settings.max_error_examples));
        let cancel = self.cancel.child_token();
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = spawn_heartbeat(Arc::clone(&accounting), self.settings.heartbeat(), heartbeat_stop.clone());
        let progress = RunProgress::new(DATASET, self.show_progress);

        let (tx, mut rx) = mpsc::channel(self.settings.max_inflight.max(1));
        source.stop_on(cancel.clone());
        let reader = PortionReader {
            normalizer,
            accounting: Arc::clone(&accounting),
            progress: progress.clone(),
            chunk_size: self.settings.batch_size.max(1),
        };
        let produced = tokio::task::spawn_blocking(move || reader.run(source, tx));

        let mut writer = PortionWriter {
            store: &mut *store,
            settings: self.settings.dispatch(),
            accounting: Arc::clone(&accounting),
            cancel: cancel.clone(),
            known: HashMap::new(),
            clear_threshold: self.settings.cache_clear_threshold.max(1),
            attached: 0,
        };
        let mut batch_id = 0;
        while let Some(chunk) = rx.recv().await {
            batch_id += 1;
            writer.write_chunk(batch_id, chunk).await;
            progress.update(&accounting.snapshot());
        }
        let attached = writer.attached;

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
        match produced.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                error!(error = %e, "Source read failed, aborting stage");
                accounting.set_abort_reason(format!("source read failed: {e}"));
                cancel.cancel();
            },
            Err(e) => {
                error!(error = %e, "Reader terminated abnormally");
                accounting.set_abort_reason(format!("reader terminated abnormally: {e}"));
                cancel.cancel();
            },
        }

        let status = if cancel.is_cancelled() {
            RunStatus::Aborted {
                reason: accounting.abort_reason().unwrap_or_else(|| "interrupted".to_string()),
            }
        } else {
            RunStatus::Completed
        };

        let totals = accounting.snapshot();
        progress.finish(&totals);
        if !totals.is_balanced() {
            warn!(?totals, "Stage totals do not add up");
        }

        let report = RunReport {
            run_id,
            dataset: DATASET.to_string(),
            sink: sink.to_string(),
            status,
            started_at,
            elapsed: started.elapsed(),
            totals,
        };
        info!(%run_id, attached, "Portion measurements added");
        report.log_summary();
        Ok(report)
    }
}

/// The blocking half of the stage: read, normalize, chunk
struct PortionReader {
    normalizer: Arc<PortionNormalizer>,
    accounting: Arc<RunAccounting>,
    progress: RunProgress,
    chunk_size: usize,
}

impl PortionReader {
    fn run<R: Read>(self, source: CsvSource<R>, tx: mpsc::Sender<Vec<FdcPortion>>) -> Result<(), SourceError> {
        let mut chunk = Vec::with_capacity(self.chunk_size);

        for item in source {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) if e.is_row_level() => {
                    warn!(error = %e, "Skipping unreadable row");
                    self.scanned();
                    self.accounting.row_skipped(SkipReason::Malformed);
                    continue;
                },
                Err(e) => {
                    if !chunk.is_empty() {
                        self.accounting.batch_abandoned(chunk.len());
                    }
                    return Err(e);
                },
            };
            self.scanned();

            match self.normalizer.normalize(&raw) {
                Ok(portion) => chunk.push(portion),
                Err(reason) => {
                    debug!(line = raw.line(), %reason, "Portion skipped");
                    self.accounting.row_skipped(reason);
                },
            }
            if chunk.len() >= self.chunk_size {
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(self.chunk_size));
                if !self.send(&tx, full) {
                    return Ok(());
                }
            }
        }

        if !chunk.is_empty() {
            self.send(&tx, chunk);
        }
        Ok(())
    }

    fn scanned(&self) {
        self.accounting.row_scanned();
        self.progress.row();
    }

    /// False once the writer has gone away
    fn send(&self, tx: &mpsc::Sender<Vec<FdcPortion>>, chunk: Vec<FdcPortion>) -> bool {
        match tx.blocking_send(chunk) {
            Ok(()) => true,
            Err(mpsc::error::SendError(rejected)) => {
                self.accounting.batch_abandoned(rejected.len());
                false
            },
        }
    }
}

/// Result of a store call after retries
struct Attempted<T> {
    result: Result<T, SinkError>,
    attempts: u32,
    latency: Duration,
}

struct PortionWriter<'a, S: PortionStore> {
    store: &'a mut S,
    settings: DispatchSettings,
    accounting: Arc<RunAccounting>,
    cancel: CancellationToken,
    /// Source id -> stored food, `None` when the food is not stored
    known: HashMap<String, Option<SinkId>>,
    clear_threshold: usize,
    attached: u64,
}

impl<S: PortionStore> PortionWriter<'_, S> {
    async fn write_chunk(&mut self, batch_id: u64, chunk: Vec<FdcPortion>) {
        if self.cancel.is_cancelled() {
            self.accounting.batch_abandoned(chunk.len());
            return;
        }

        let mut missing: Vec<String> = chunk
            .iter()
            .filter(|portion| !self.known.contains_key(&portion.fdc_id))
            .map(|portion| portion.fdc_id.clone())
            .collect();
        missing.sort_unstable();
        missing.dedup();

        // Lookup retries are reported with the chunk
        let mut lookup_retries = 0;
        let found = if missing.is_empty() {
            HashMap::new()
        } else {
            let resolved = self.resolve(batch_id, &missing).await;
            match resolved.result {
                Ok(found) => {
                    lookup_retries = resolved.attempts - 1;
                    found
                },
                Err(e) => {
                    self.accounting.batch_submitted(chunk.len());
                    self.finish(DispatchResult::failed(
                        batch_id,
                        chunk.len(),
                        resolved.attempts,
                        resolved.latency,
                        &e,
                    ));
                    return;
                },
            }
        };

        let mut portions: Vec<(SinkId, Measurement)> = Vec::with_capacity(chunk.len());
        for portion in chunk {
            let food = match self.known.get(&portion.fdc_id) {
                Some(known) => *known,
                None => found.get(&portion.fdc_id).copied(),
            };
            match food {
                Some(id) => portions.push((id, portion.measurement)),
                None => self.accounting.row_skipped(SkipReason::UnknownFood),
            }
        }
        self.remember(missing, &found);

        if portions.is_empty() {
            return;
        }
        self.accounting.batch_submitted(portions.len());
        let written = self.attach(batch_id, &portions).await;
        let attempts = written.attempts + lookup_retries;
        let result = match written.result {
            Ok(added) => {
                self.attached += added;
                debug!(batch_id, portions = portions.len(), added, "Portions attached");
                DispatchResult::succeeded(batch_id, portions.len(), attempts, written.latency, BatchReceipt::default())
            },
            Err(e) => DispatchResult::failed(batch_id, portions.len(), attempts, written.latency, &e),
        };
        self.finish(result);
    }

    fn remember(&mut self, resolved: Vec<String>, found: &HashMap<String, SinkId>) {
        if self.known.len() + resolved.len() > self.clear_threshold {
            debug!(threshold = self.clear_threshold, "Food id cache cleared");
            self.known.clear();
        }
        for source_id in resolved {
            let id = found.get(&source_id).copied();
            self.known.insert(source_id, id);
        }
    }

    fn finish(&self, result: DispatchResult) {
        if result.fatal {
            let reason = result.error.clone().unwrap_or_else(|| "fatal store error".to_string());
            error!(batch_id = result.batch_id, reason = %reason, "Fatal store error, aborting stage");
            self.accounting.set_abort_reason(reason);
            self.cancel.cancel();
        } else if !result.ok {
            warn!(batch_id = result.batch_id, rows = result.row_count, "Portion chunk failed");
        }
        self.accounting.record_dispatch(&result);
    }

    async fn resolve(&mut self, batch_id: u64, source_ids: &[String]) -> Attempted<HashMap<String, SinkId>> {
        let mut attempts = 0;
        loop {
            let started = Instant::now();
            let result = self.store.food_ids(source_ids).await;
            attempts += 1;
            match result {
                Err(e) if e.is_retryable() && attempts <= self.settings.max_retries => {
                    self.back_off(batch_id, attempts, &e).await;
                },
                result => {
                    return Attempted {
                        result,
                        attempts,
                        latency: started.elapsed(),
                    }
                },
            }
        }
    }

    async fn attach(&mut self, batch_id: u64, portions: &[(SinkId, Measurement)]) -> Attempted<u64> {
        let mut attempts = 0;
        loop {
            let started = Instant::now();
            let result = self.store.attach(portions).await;
            attempts += 1;
            match result {
                Err(e) if e.is_retryable() && attempts <= self.settings.max_retries => {
                    self.back_off(batch_id, attempts, &e).await;
                },
                result => {
                    return Attempted {
                        result,
                        attempts,
                        latency: started.elapsed(),
                    }
                },
            }
        }
    }

    async fn back_off(&self, batch_id: u64, attempts: u32, error: &SinkError) {
        let delay = self.settings.backoff(attempts - 1);
        warn!(
            batch_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient store failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::match_cache::MatchCache;
    use crate::record::NormalizedRecord;
    use crate::sink::memory::{MemorySinkFactory, MemoryStore};
    use crate::sink::{Sink, SinkFactory};
    use crate::source::SourceOptions;
    use async_trait::async_trait;

    const PORTIONS: &str = "id,fdc_id,amount,measure_unit_id,portion_description,modifier,gram_weight\n\
                            1,100,1,1000,,,125\n\
                            2,100,1,,1 medium,,182\n\
                            3,404,1,1000,,,99\n\
                            4,200,1,1000,,,0\n\
                            5,200,2,1000,,,240\n";

    fn normalizer() -> Arc<PortionNormalizer> {
        Arc::new(PortionNormalizer::new(HashMap::from([("1000".to_string(), "oz".to_string())])).unwrap())
    }

    fn source() -> CsvSource<&'static [u8]> {
        CsvSource::from_reader(PORTIONS.as_bytes(), SourceOptions::csv()).unwrap()
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            batch_size: 2,
            workers: 1,
            max_inflight: 1,
            retry_backoff_ms: 1,
            ..PipelineSettings::default()
        }
    }

    async fn stored_foods() -> MemoryStore {
        let factory = MemorySinkFactory::default();
        let mut sink = factory.connect(0).await.unwrap();
        let foods = vec![NormalizedRecord::new("100", "Apple", 52), NormalizedRecord::new("200", "Milk", 42)];
        sink.write_batch(&Batch::new(1, foods).unwrap(), &MatchCache::default())
            .await
            .unwrap();
        factory.store().clone()
    }

    #[tokio::test]
    async fn test_portions_attach_to_imported_foods() {
        let mut store = stored_foods().await;
        let report = PortionStage::new(settings())
            .run(source(), normalizer(), &mut store)
            .await
            .unwrap();

        assert!(report.is_completed());
        let totals = &report.totals;
        assert!(totals.is_balanced());
        assert_eq!(totals.rows_scanned, 5);
        assert_eq!(totals.rows_succeeded, 3);
        assert_eq!(totals.skipped_by_reason.get("unknown_food"), Some(&1));
        assert_eq!(totals.skipped_by_reason.get("invalid_portion"), Some(&1));

        let apple = store.food(SinkId(1)).unwrap();
        let names: Vec<&str> = apple.measurements.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["100 grams", "1 gram", "1 oz", "1 medium"]);
        let milk = store.food(SinkId(2)).unwrap();
        assert_eq!(milk.measurements.last().unwrap().name, "2 oz");
        assert_eq!(milk.measurements.last().unwrap().weight_in_grams, 240.0);
    }

    #[tokio::test]
    async fn test_rerun_adds_nothing_new() {
        let mut store = stored_foods().await;
        let stage = PortionStage::new(settings());
        stage.run(source(), normalizer(), &mut store).await.unwrap();
        let before = store.food(SinkId(1)).unwrap().measurements.len();

        let report = stage.run(source(), normalizer(), &mut store).await.unwrap();
        assert_eq!(report.totals.rows_succeeded, 3);
        assert_eq!(store.food(SinkId(1)).unwrap().measurements.len(), before);
    }

    /// Fails id lookups a fixed number of times with the given error
    struct Flaky {
        inner: MemoryStore,
        failures: u32,
        error: SinkError,
        lookups: u32,
    }

    #[async_trait]
    impl PortionStore for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn food_ids(&mut self, source_ids: &[String]) -> Result<HashMap<String, SinkId>, SinkError> {
            self.lookups += 1;
            if self.failures > 0 {
                self.failures -= 1;
                return Err(self.error.clone());
            }
            self.inner.food_ids(source_ids).await
        }

        async fn attach(&mut self, portions: &[(SinkId, Measurement)]) -> Result<u64, SinkError> {
            self.inner.attach(portions).await
        }
    }

    #[tokio::test]
    async fn test_transient_lookup_failures_are_retried() {
        let mut store = Flaky {
            inner: stored_foods().await,
            failures: 2,
            error: SinkError::Transient("connection reset".into()),
            lookups: 0,
        };
        let report = PortionStage::new(settings())
            .run(source(), normalizer(), &mut store)
            .await
            .unwrap();

        assert!(report.is_completed());
        assert_eq!(report.totals.rows_succeeded, 3);
        assert!(report.totals.retries >= 2);
    }

    #[tokio::test]
    async fn test_fatal_lookup_aborts_stage() {
        let mut store = Flaky {
            inner: stored_foods().await,
            failures: u32::MAX,
            error: SinkError::Fatal("password authentication failed".into()),
            lookups: 0,
        };
        let report = PortionStage::new(settings())
            .run(source(), normalizer(), &mut store)
            .await
            .unwrap();

        assert_eq!(
            report.status,
            RunStatus::Aborted {
                reason: "password authentication failed".into()
            }
        );
        assert!(report.totals.is_balanced());
        assert_eq!(report.totals.rows_succeeded, 0);
        assert_eq!(store.lookups, 1);
    }

    #[tokio::test]
    async fn test_missing_columns_fail_before_reading() {
        let source = CsvSource::from_reader("fdc_id,amount\n1,1\n".as_bytes(), SourceOptions::csv()).unwrap();
        let mut store = MemoryStore::new();
        let err = PortionStage::new(settings())
            .run(source, normalizer(), &mut store)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("gram_weight"));
    }
}
