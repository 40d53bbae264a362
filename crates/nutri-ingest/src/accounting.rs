//! Run accounting
//!
//! Counters shared by the producer and every dispatch worker. Counters only
//! ever increase. A batch counts as submitted once a worker takes it from
//! the queue, and as abandoned if it is sealed but never reaches a sink. Rows are accounted as a
//! whole batch: a batch either succeeds with all its rows or fails with all
//! of them.
//!
//! For every snapshot taken after a run has finished:
//!
//! - `rows_scanned == rows_skipped + rows_submitted + rows_abandoned`
//! - `rows_submitted == rows_succeeded + rows_failed`

use crate::dispatch::DispatchResult;
use crate::normalize::SkipReason;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default number of error messages kept for the final report
pub const DEFAULT_MAX_ERROR_EXAMPLES: usize = 10;

/// Default interval between heartbeat log lines
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Default)]
struct Samples {
    errors: Vec<String>,
    skipped_by_reason: BTreeMap<&'static str, u64>,
    abort_reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct RunAccounting {
    rows_scanned: AtomicU64,
    rows_skipped: AtomicU64,
    rows_submitted: AtomicU64,
    rows_succeeded: AtomicU64,
    rows_failed: AtomicU64,
    rows_abandoned: AtomicU64,
    batches_submitted: AtomicU64,
    batches_succeeded: AtomicU64,
    batches_failed: AtomicU64,
    batches_abandoned: AtomicU64,
    records_created: AtomicU64,
    records_matched: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    latency_micros: AtomicU64,
    errors_total: AtomicU64,
    samples: Mutex<Samples>,
    max_error_examples: usize,
}

impl RunAccounting {
    pub fn new(max_error_examples: usize) -> Self {
        Self {
            max_error_examples,
            ..Self::default()
        }
    }

    fn samples(&self) -> MutexGuard<'_, Samples> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn row_scanned(&self) {
        self.rows_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn row_skipped(&self, reason: SkipReason) {
        self.rows_skipped.fetch_add(1, Ordering::Relaxed);
        *self.samples().skipped_by_reason.entry(reason.as_str()).or_insert(0) += 1;
    }

    /// A worker took a batch and is about to write it
    pub fn batch_submitted(&self, rows: usize) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
        self.rows_submitted.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// A sealed batch that was never handed to a sink
    pub fn batch_abandoned(&self, rows: usize) {
        self.batches_abandoned.fetch_add(1, Ordering::Relaxed);
        self.rows_abandoned.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Fold in the outcome of one dispatched batch
    pub fn record_dispatch(&self, result: &DispatchResult) {
        let rows = result.row_count as u64;
        if result.ok {
            self.batches_succeeded.fetch_add(1, Ordering::Relaxed);
            self.rows_succeeded.fetch_add(rows, Ordering::Relaxed);
            self.records_created
                .fetch_add(result.receipt.created.len() as u64, Ordering::Relaxed);
            self.records_matched
                .fetch_add(result.receipt.matched as u64, Ordering::Relaxed);
        } else {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
            self.rows_failed.fetch_add(rows, Ordering::Relaxed);
        }

        self.attempts.fetch_add(u64::from(result.attempts), Ordering::Relaxed);
        self.retries
            .fetch_add(u64::from(result.attempts.saturating_sub(1)), Ordering::Relaxed);
        self.latency_micros
            .fetch_add(result.latency.as_micros() as u64, Ordering::Relaxed);

        if let Some(error) = &result.error {
            self.note_error(format!("batch {}: {error}", result.batch_id));
        }
    }

    /// Count an error, keeping the message if the sample is not full yet
    pub fn note_error(&self, message: String) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples();
        if samples.errors.len() < self.max_error_examples {
            samples.errors.push(message);
        }
    }

    /// Remember why the run aborted; the first reason wins
    pub fn set_abort_reason(&self, reason: impl Into<String>) {
        let mut samples = self.samples();
        if samples.abort_reason.is_none() {
            samples.abort_reason = Some(reason.into());
        }
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.samples().abort_reason.clone()
    }

    pub fn snapshot(&self) -> AccountingSnapshot {
        let samples = self.samples();
        AccountingSnapshot {
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            rows_submitted: self.rows_submitted.load(Ordering::Relaxed),
            rows_succeeded: self.rows_succeeded.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            rows_abandoned: self.rows_abandoned.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_succeeded: self.batches_succeeded.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_abandoned: self.batches_abandoned.load(Ordering::Relaxed),
            records_created: self.records_created.load(Ordering::Relaxed),
            records_matched: self.records_matched.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.latency_micros.load(Ordering::Relaxed)),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            error_examples: samples.errors.clone(),
            skipped_by_reason: samples
                .skipped_by_reason
                .iter()
                .map(|(reason, count)| ((*reason).to_string(), *count))
                .collect(),
        }
    }
}

/// Point-in-time copy of the run counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountingSnapshot {
    pub rows_scanned: u64,
    pub rows_skipped: u64,
    pub rows_submitted: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub rows_abandoned: u64,
    pub batches_submitted: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub batches_abandoned: u64,
    pub records_created: u64,
    pub records_matched: u64,
    pub attempts: u64,
    pub retries: u64,
    pub total_latency: Duration,
    pub errors_total: u64,
    pub error_examples: Vec<String>,
    pub skipped_by_reason: BTreeMap<String, u64>,
}

impl AccountingSnapshot {
    /// Mean sink latency per attempt
    pub fn avg_latency(&self) -> Duration {
        match u32::try_from(self.attempts) {
            Ok(0) => Duration::ZERO,
            Ok(attempts) => self.total_latency / attempts,
            Err(_) => Duration::from_micros((self.total_latency.as_micros() / u128::from(self.attempts)) as u64),
        }
    }

    /// Whether the row totals add up
    pub fn is_balanced(&self) -> bool {
        self.rows_scanned == self.rows_skipped + self.rows_submitted + self.rows_abandoned
            && self.rows_submitted == self.rows_succeeded + self.rows_failed
    }
}

/// Log a progress line every `every` until `stop` is cancelled
pub fn spawn_heartbeat(accounting: Arc<RunAccounting>, every: Duration, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = accounting.snapshot();
                    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                    info!(
                        scanned = snapshot.rows_scanned,
                        submitted = snapshot.rows_submitted,
                        succeeded = snapshot.rows_succeeded,
                        failed = snapshot.rows_failed,
                        skipped = snapshot.rows_skipped,
                        created = snapshot.records_created,
                        matched = snapshot.records_matched,
                        rows_per_sec = format!("{:.1}", snapshot.rows_scanned as f64 / elapsed),
                        "Heartbeat"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sink::BatchReceipt;

    fn result(batch_id: u64, rows: usize, ok: bool, attempts: u32) -> DispatchResult {
        DispatchResult {
            batch_id,
            row_count: rows,
            ok,
            attempts,
            latency: Duration::from_millis(10),
            fatal: false,
            error: (!ok).then(|| "HTTP 422: bad".to_string()),
            receipt: BatchReceipt::default(),
        }
    }

    #[test]
    fn test_totals_balance() {
        let accounting = RunAccounting::new(DEFAULT_MAX_ERROR_EXAMPLES);
        for _ in 0..7 {
            accounting.row_scanned();
        }
        accounting.row_skipped(SkipReason::MissingName);
        accounting.batch_submitted(2);
        accounting.batch_submitted(2);
        accounting.batch_abandoned(1);
        accounting.record_dispatch(&result(1, 2, true, 1));
        accounting.record_dispatch(&result(2, 2, false, 4));
        accounting.batch_abandoned(1);

        let snapshot = accounting.snapshot();
        assert!(snapshot.is_balanced(), "{snapshot:?}");
        assert_eq!(snapshot.rows_abandoned, 2);
        assert_eq!(snapshot.batches_abandoned, 2);
        assert_eq!(snapshot.retries, 3);
        assert_eq!(snapshot.skipped_by_reason.get("missing_name"), Some(&1));
        assert_eq!(snapshot.error_examples, vec!["batch 2: HTTP 422: bad".to_string()]);
    }

    #[test]
    fn test_error_sample_is_bounded() {
        let accounting = RunAccounting::new(2);
        for i in 0..5 {
            accounting.note_error(format!("error {i}"));
        }
        let snapshot = accounting.snapshot();
        assert_eq!(snapshot.errors_total, 5);
        assert_eq!(snapshot.error_examples, vec!["error 0".to_string(), "error 1".to_string()]);
    }

    #[test]
    fn test_first_abort_reason_wins() {
        let accounting = RunAccounting::default();
        accounting.set_abort_reason("unauthorized response (403)");
        accounting.set_abort_reason("interrupted");
        assert_eq!(accounting.abort_reason().as_deref(), Some("unauthorized response (403)"));
    }

    #[test]
    fn test_avg_latency() {
        let accounting = RunAccounting::default();
        assert_eq!(accounting.snapshot().avg_latency(), Duration::ZERO);
        accounting.record_dispatch(&result(1, 1, true, 2));
        assert_eq!(accounting.snapshot().avg_latency(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_on_cancel() {
        let stop = CancellationToken::new();
        let handle = spawn_heartbeat(Arc::new(RunAccounting::default()), Duration::from_secs(30), stop.clone());
        tokio::time::sleep(Duration::from_secs(95)).await;
        stop.cancel();
        handle.await.unwrap();
    }
}
