//! Ingestion run orchestration
//!
//! ```text
//! RecordSource -> Normalizer -> MatchCache -> Batcher --(bounded queue)--> workers -> Sink
//!   (blocking producer thread)                                       (async, W of them)
//! ```
//!
//! The producer runs on a blocking thread and waits whenever the dispatcher
//! has `max_inflight` batches outstanding. A fatal sink error or an external
//! cancellation stops the producer; batches already being written finish,
//! queued ones are abandoned. The run ends as completed or aborted.
//!
//! A record the match cache does not know is claimed for the batch being
//! filled, so a later batch carrying the same food is written only after
//! the first one has created it.

use crate::accounting::{spawn_heartbeat, AccountingSnapshot, RunAccounting};
use crate::batch::{Batch, Batcher};
use crate::config::PipelineSettings;
use crate::dispatch::{Dispatcher, Submitter};
use crate::error::SourceError;
use crate::match_cache::MatchCache;
use crate::normalize::{Normalized, Normalizer, SkipReason};
use crate::progress::RunProgress;
use crate::sink::SinkFactory;
use crate::source::{CsvSource, RecordSource};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Exit status of a completed run
pub const EXIT_COMPLETED: u8 = 0;

/// Exit status of a run that failed to start
pub const EXIT_SETUP_FAILED: u8 = 1;

/// Exit status of an aborted run
pub const EXIT_ABORTED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted { reason: String },
}

/// Summary of one ingestion run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub dataset: String,
    pub sink: String,
    #[serde(flatten)]
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub totals: AccountingSnapshot,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Completed => EXIT_COMPLETED,
            RunStatus::Aborted { .. } => EXIT_ABORTED,
        }
    }

    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.totals.rows_scanned as f64 / secs
        } else {
            0.0
        }
    }

    /// Emit the final summary as one `info!` event, followed by the error sample
    pub fn log_summary(&self) {
        let totals = &self.totals;
        let (status, reason) = match &self.status {
            RunStatus::Completed => ("completed", None),
            RunStatus::Aborted { reason } => ("aborted", Some(reason.as_str())),
        };
        info!(
            run_id = %self.run_id,
            dataset = %self.dataset,
            sink = %self.sink,
            status,
            reason,
            scanned = totals.rows_scanned,
            skipped = totals.rows_skipped,
            succeeded = totals.rows_succeeded,
            failed = totals.rows_failed,
            abandoned = totals.rows_abandoned,
            batches_ok = totals.batches_succeeded,
            batches_failed = totals.batches_failed,
            created = totals.records_created,
            matched = totals.records_matched,
            retries = totals.retries,
            avg_latency_ms = totals.avg_latency().as_millis() as u64,
            elapsed_secs = %format!("{:.1}", self.elapsed.as_secs_f64()),
            rows_per_sec = %format!("{:.1}", self.rows_per_sec()),
            "Ingestion run finished"
        );
        for example in &totals.error_examples {
            warn!(run_id = %self.run_id, error = %example, "Sample error");
        }
        let unsampled = totals.errors_total.saturating_sub(totals.error_examples.len() as u64);
        if unsampled > 0 {
            warn!(run_id = %self.run_id, unsampled, "Further errors not shown");
        }
    }
}

/// Open `path` with the layout `normalizer` expects and the chunking of `settings`
pub fn open_source(
    path: impl AsRef<Path>,
    normalizer: &dyn Normalizer,
    settings: &PipelineSettings,
    skip_rows: Option<usize>,
) -> Result<CsvSource<File>, SourceError> {
    let mut options = normalizer
        .source_options()
        .chunk_size(settings.chunk_size)
        .max_rows(settings.max_rows);
    if let Some(rows) = skip_rows {
        options = options.skip_rows(rows);
    }
    CsvSource::open(path, options)
}

pub struct Pipeline {
    settings: PipelineSettings,
    matches: Arc<MatchCache>,
    cancel: CancellationToken,
    show_progress: bool,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        let matches = Arc::new(MatchCache::new(settings.cache_clear_threshold));
        Self {
            settings,
            matches,
            cancel: CancellationToken::new(),
            show_progress: false,
        }
    }

    /// Use an existing (usually pre-warmed) match cache
    pub fn with_match_cache(mut self, matches: Arc<MatchCache>) -> Self {
        self.matches = matches;
        self
    }

    /// Abort runs when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, visible: bool) -> Self {
        self.show_progress = visible;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn match_cache(&self) -> &Arc<MatchCache> {
        &self.matches
    }

    /// Stream `source` through `normalizer` into sinks made by `factory`.
    ///
    /// Errors are returned only for problems before the first write: a
    /// missing required column or a sink that cannot connect. Everything
    /// after that is reflected in the report's status and totals.
    pub async fn run<S, F>(&self, mut source: S, normalizer: Arc<dyn Normalizer>, factory: &F) -> anyhow::Result<RunReport>
    where
        S: RecordSource,
        F: SinkFactory,
    {
        let dataset = normalizer.dataset();
        source
            .check_columns(normalizer.required_columns())
            .with_context(|| format!("{dataset} source is not usable"))?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            %run_id,
            dataset,
            sink = factory.name(),
            batch_size = self.settings.batch_size,
            workers = self.settings.workers,
            max_inflight = self.settings.max_inflight,
            "Starting ingestion run"
        );

        let accounting = Arc::new(RunAccounting::new(self.settings.max_error_examples));
        let cancel = self.cancel.child_token();

        let (dispatcher, submitter) = Dispatcher::start(
            factory,
            self.settings.dispatch(),
            Arc::clone(&self.matches),
            Arc::clone(&accounting),
            cancel.clone(),
        )
        .await
        .with_context(|| format!("failed to connect {} sink", factory.name()))?;

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = spawn_heartbeat(Arc::clone(&accounting), self.settings.heartbeat(), heartbeat_stop.clone());

        let progress = RunProgress::new(dataset, self.show_progress);
        let producer = Producer {
            normalizer,
            matches: Arc::clone(&self.matches),
            accounting: Arc::clone(&accounting),
            batch_size: self.settings.batch_size,
            progress: progress.clone(),
        };
        source.stop_on(cancel.clone());
        let produced = tokio::task::spawn_blocking(move || producer.run(source, submitter)).await;

        let panicked = dispatcher.finish().await;
        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }

        match produced {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                error!(error = %e, "Source read failed, aborting run");
                accounting.set_abort_reason(format!("source read failed: {e}"));
                cancel.cancel();
            },
            Err(e) => {
                error!(error = %e, "Producer terminated abnormally");
                accounting.set_abort_reason(format!("producer terminated abnormally: {e}"));
                cancel.cancel();
            },
        }
        if panicked > 0 {
            accounting.set_abort_reason(format!("{panicked} dispatch worker(s) terminated abnormally"));
            cancel.cancel();
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
            warn!(?totals, "Run totals do not add up");
        }

        let report = RunReport {
            run_id,
            dataset: dataset.to_string(),
            sink: factory.name().to_string(),
            status,
            started_at,
            elapsed: started.elapsed(),
            totals,
        };
        report.log_summary();
        Ok(report)
    }
}

/// The blocking half of a run: read, normalize, match, batch, submit
struct Producer {
    normalizer: Arc<dyn Normalizer>,
    matches: Arc<MatchCache>,
    accounting: Arc<RunAccounting>,
    batch_size: usize,
    progress: RunProgress,
}

impl Producer {
    fn run<S: RecordSource>(self, source: S, submitter: Submitter) -> Result<(), SourceError> {
        let mut batcher = Batcher::new(self.batch_size);

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
                    if let Some(batch) = batcher.flush(true) {
                        self.accounting.batch_abandoned(batch.len());
                        self.matches.release(&batch);
                    }
                    return Err(e);
                },
            };
            self.scanned();

            match self.normalizer.normalize(&raw) {
                Normalized::Skip(reason) => {
                    debug!(line = raw.line(), %reason, "Row skipped");
                    self.accounting.row_skipped(reason);
                },
                Normalized::Record(record) => {
                    let matched = self.matches.lookup(&record.natural_key);
                    if matched.is_none() {
                        self.matches.claim(&record.natural_key, batcher.open_id());
                    }
                    if let Some(batch) = batcher.add((*record).with_matched(matched)) {
                        if !self.submit(&submitter, batch) {
                            break;
                        }
                    }
                },
            }
        }

        if let Some(batch) = batcher.flush(true) {
            self.submit(&submitter, batch);
        }
        Ok(())
    }

    fn scanned(&self) {
        self.accounting.row_scanned();
        self.progress.row();
    }

    /// Hand `batch` to the dispatcher; false once the run is aborting
    fn submit(&self, submitter: &Submitter, batch: Batch) -> bool {
        let batch_id = batch.id();
        match submitter.blocking_submit(batch) {
            Ok(()) => {
                self.progress.update(&self.accounting.snapshot());
                true
            },
            Err(rejected) => {
                debug!(batch_id, rows = rejected.rows, "Batch abandoned, run is aborting");
                false
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn report(status: RunStatus) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            dataset: "myfooddata".into(),
            sink: "memory".into(),
            status,
            started_at: Utc::now(),
            elapsed: Duration::from_secs(2),
            totals: AccountingSnapshot {
                rows_scanned: 10,
                ..AccountingSnapshot::default()
            },
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(RunStatus::Completed).exit_code(), EXIT_COMPLETED);
        let aborted = report(RunStatus::Aborted {
            reason: "interrupted".into(),
        });
        assert_eq!(aborted.exit_code(), EXIT_ABORTED);
        assert!(!aborted.is_completed());
    }

    #[test]
    fn test_rows_per_sec() {
        assert!((report(RunStatus::Completed).rows_per_sec() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_serializes_status_inline() {
        let value = serde_json::to_value(report(RunStatus::Aborted {
            reason: "unauthorized response (403)".into(),
        }))
        .unwrap();
        assert_eq!(value["status"], "aborted");
        assert_eq!(value["reason"], "unauthorized response (403)");
        assert_eq!(value["totals"]["rows_scanned"], 10);
    }
}
