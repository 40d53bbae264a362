//! Bounded concurrent dispatch
//!
//! Sealed batches go through a bounded queue to a fixed pool of workers.
//! A semaphore caps how many batches are queued or in flight at once, so
//! the producer blocks in [`Submitter::submit`] once the cap is reached.
//!
//! Each worker owns one sink and writes one batch at a time, retrying
//! transient failures with exponential backoff. A fatal failure cancels the
//! run: the producer stops, queued batches are dropped unsent and counted
//! as abandoned, and batches already being written finish normally.
//!
//! Before writing, a worker waits for any earlier batch that is creating
//! one of its natural keys ([`MatchCache::settle`]). Claims are released
//! when a batch finishes, fails or is abandoned.

use crate::accounting::RunAccounting;
use crate::batch::Batch;
use crate::error::SinkError;
use crate::match_cache::MatchCache;
use crate::sink::{BatchReceipt, Sink, SinkFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// ============================================================================
// Dispatch Constants
// ============================================================================

/// Default number of concurrent sink workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default cap on queued plus in-flight batches
pub const DEFAULT_MAX_INFLIGHT: usize = 16;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry; doubles on each further retry
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub workers: usize,
    pub max_inflight: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

impl DispatchSettings {
    /// Delay before retry number `retry` (zero-based): `base * 2^retry`
    pub fn backoff(&self, retry: u32) -> Duration {
        self.retry_backoff.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Outcome of one batch after all attempts
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub batch_id: u64,
    pub row_count: usize,
    pub ok: bool,
    pub attempts: u32,
    /// Duration of the last attempt
    pub latency: Duration,
    pub fatal: bool,
    pub error: Option<String>,
    pub receipt: BatchReceipt,
}

impl DispatchResult {
    pub fn succeeded(batch_id: u64, row_count: usize, attempts: u32, latency: Duration, receipt: BatchReceipt) -> Self {
        Self {
            batch_id,
            row_count,
            ok: true,
            attempts,
            latency,
            fatal: false,
            error: None,
            receipt,
        }
    }

    pub fn failed(batch_id: u64, row_count: usize, attempts: u32, latency: Duration, error: &SinkError) -> Self {
        Self {
            batch_id,
            row_count,
            ok: false,
            attempts,
            latency,
            fatal: error.is_fatal(),
            error: Some(error.to_string()),
            receipt: BatchReceipt::default(),
        }
    }
}

/// A batch the dispatcher refused because the run is aborting
#[derive(Debug, Error)]
#[error("run is aborting; batch {batch_id} ({rows} rows) was not submitted")]
pub struct SubmitRejected {
    pub batch_id: u64,
    pub rows: usize,
}

struct Queued {
    batch: Batch,
    slot: OwnedSemaphorePermit,
}

/// Producer-side handle of a running [`Dispatcher`]
///
/// The queue closes when the last submitter is dropped.
#[derive(Clone)]
pub struct Submitter {
    queue: mpsc::Sender<Queued>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    accounting: Arc<RunAccounting>,
    matches: Arc<MatchCache>,
    handle: Handle,
}

impl Submitter {
    /// Queue `batch`, waiting for a free slot.
    ///
    /// Fails without sending once the run is cancelled; the batch is then
    /// counted as abandoned and its claims are released.
    pub async fn submit(&self, batch: Batch) -> Result<(), SubmitRejected> {
        let slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            slot = Arc::clone(&self.slots).acquire_owned() => slot.ok(),
        };
        let Some(slot) = slot.filter(|_| !self.cancel.is_cancelled()) else {
            return Err(self.abandon(&batch));
        };

        if let Err(mpsc::error::SendError(queued)) = self.queue.send(Queued { batch, slot }).await {
            return Err(self.abandon(&queued.batch));
        }
        Ok(())
    }

    fn abandon(&self, batch: &Batch) -> SubmitRejected {
        self.accounting.batch_abandoned(batch.len());
        self.matches.release(batch);
        SubmitRejected {
            batch_id: batch.id(),
            rows: batch.len(),
        }
    }

    /// [`Submitter::submit`] for the blocking producer thread
    pub fn blocking_submit(&self, batch: Batch) -> Result<(), SubmitRejected> {
        self.handle.block_on(self.submit(batch))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct WorkerContext {
    settings: DispatchSettings,
    matches: Arc<MatchCache>,
    accounting: Arc<RunAccounting>,
    cancel: CancellationToken,
}

/// Running pool of sink workers
pub struct Dispatcher {
    workers: JoinSet<()>,
}

impl Dispatcher {
    /// Connect one sink per worker and start the pool.
    ///
    /// Connection failures are returned before any batch is accepted.
    pub async fn start<F: SinkFactory>(
        factory: &F,
        settings: DispatchSettings,
        matches: Arc<MatchCache>,
        accounting: Arc<RunAccounting>,
        cancel: CancellationToken,
    ) -> Result<(Self, Submitter), SinkError> {
        let workers = settings.workers.max(1);
        let max_inflight = settings.max_inflight.max(workers);

        let mut sinks = Vec::with_capacity(workers);
        for worker in 0..workers {
            sinks.push(factory.connect(worker).await?);
        }

        let (tx, rx) = mpsc::channel(max_inflight);
        let rx = Arc::new(Mutex::new(rx));
        let ctx = Arc::new(WorkerContext {
            settings,
            matches: Arc::clone(&matches),
            accounting: Arc::clone(&accounting),
            cancel: cancel.clone(),
        });

        let mut set = JoinSet::new();
        for (worker, sink) in sinks.into_iter().enumerate() {
            set.spawn(worker_loop(worker, sink, Arc::clone(&rx), Arc::clone(&ctx)));
        }
        debug!(sink = factory.name(), workers, max_inflight, "Dispatcher started");

        let submitter = Submitter {
            queue: tx,
            slots: Arc::new(Semaphore::new(max_inflight)),
            cancel,
            accounting,
            matches,
            handle: Handle::current(),
        };
        Ok((Self { workers: set }, submitter))
    }

    /// Wait for every worker to drain the queue and exit.
    ///
    /// Returns once all [`Submitter`]s have been dropped and the queue is
    /// empty. The number of workers that panicked is returned.
    pub async fn finish(mut self) -> usize {
        let mut panicked = 0;
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatch worker terminated abnormally");
                panicked += 1;
            }
        }
        panicked
    }
}

async fn worker_loop<S: Sink>(
    worker: usize,
    mut sink: S,
    queue: Arc<Mutex<mpsc::Receiver<Queued>>>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(Queued { batch, slot }) = next else {
            break;
        };

        let claims = Claims {
            matches: &ctx.matches,
            batch: &batch,
        };

        if ctx.cancel.is_cancelled() {
            debug!(worker, batch_id = batch.id(), "Dropping queued batch after abort");
            ctx.accounting.batch_abandoned(batch.len());
            drop(claims);
            drop(slot);
            continue;
        }

        ctx.matches.settle(&batch).await;
        ctx.accounting.batch_submitted(batch.len());

        let result = dispatch_batch(&mut sink, &batch, &ctx).await;

        if result.ok {
            for (key, id) in &result.receipt.created {
                ctx.matches.record(key.clone(), *id);
            }
        }
        if result.fatal {
            let reason = result.error.clone().unwrap_or_else(|| "fatal sink error".to_string());
            error!(worker, batch_id = result.batch_id, reason = %reason, "Fatal sink error, aborting run");
            ctx.accounting.set_abort_reason(reason);
            ctx.cancel.cancel();
        }
        ctx.accounting.record_dispatch(&result);
        drop(claims);
        drop(slot);
    }
    debug!(worker, "Dispatch worker finished");
}

/// Releases the natural keys a batch claimed, also when the worker unwinds
struct Claims<'a> {
    matches: &'a MatchCache,
    batch: &'a Batch,
}

impl Drop for Claims<'_> {
    fn drop(&mut self) {
        self.matches.release(self.batch);
    }
}

/// Write one batch, retrying transient failures
async fn dispatch_batch<S: Sink>(sink: &mut S, batch: &Batch, ctx: &WorkerContext) -> DispatchResult {
    let mut attempts: u32 = 0;
    loop {
        let started = Instant::now();
        let outcome = sink.write_batch(batch, &ctx.matches).await;
        let latency = started.elapsed();
        attempts += 1;

        match outcome {
            Ok(receipt) => {
                debug!(batch_id = batch.id(), rows = batch.len(), attempts, "Batch written");
                return DispatchResult::succeeded(batch.id(), batch.len(), attempts, latency, receipt);
            },
            Err(e) if e.is_retryable() && attempts <= ctx.settings.max_retries => {
                let delay = ctx.settings.backoff(attempts - 1);
                warn!(
                    batch_id = batch.id(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient sink failure, retrying"
                );
                tokio::time::sleep(delay).await;
            },
            Err(e) => {
                warn!(batch_id = batch.id(), rows = batch.len(), attempts, error = %e, "Batch failed");
                return DispatchResult::failed(batch.id(), batch.len(), attempts, latency, &e);
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::NormalizedRecord;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Sink that replays a fixed list of outcomes, then succeeds
    struct Scripted {
        outcomes: Arc<StdMutex<VecDeque<Result<(), SinkError>>>>,
        calls: Arc<StdMutex<Vec<u64>>>,
    }

    #[async_trait]
    impl Sink for Scripted {
        async fn write_batch(&mut self, batch: &Batch, _matches: &MatchCache) -> Result<BatchReceipt, SinkError> {
            self.calls.lock().unwrap().push(batch.id());
            let next = self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()));
            next.map(|()| BatchReceipt::default())
        }
    }

    struct ScriptedFactory {
        outcomes: Arc<StdMutex<VecDeque<Result<(), SinkError>>>>,
        calls: Arc<StdMutex<Vec<u64>>>,
    }

    impl ScriptedFactory {
        fn new(outcomes: Vec<Result<(), SinkError>>) -> Self {
            Self {
                outcomes: Arc::new(StdMutex::new(outcomes.into())),
                calls: Arc::new(StdMutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl SinkFactory for ScriptedFactory {
        type Sink = Scripted;

        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn connect(&self, _worker: usize) -> Result<Scripted, SinkError> {
            Ok(Scripted {
                outcomes: Arc::clone(&self.outcomes),
                calls: Arc::clone(&self.calls),
            })
        }
    }

    fn batch(id: u64) -> Batch {
        Batch::new(id, vec![NormalizedRecord::new(format!("s{id}"), "Rice", 130)]).unwrap()
    }

    fn single_worker() -> DispatchSettings {
        DispatchSettings {
            workers: 1,
            max_inflight: 1,
            ..DispatchSettings::default()
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = DispatchSettings::default();
        assert_eq!(settings.backoff(0), Duration::from_millis(500));
        assert_eq!(settings.backoff(1), Duration::from_millis(1000));
        assert_eq!(settings.backoff(2), Duration::from_millis(2000));
        assert_eq!(settings.backoff(40), settings.backoff(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let factory = ScriptedFactory::new(vec![
            Err(SinkError::Transient("HTTP 500".into())),
            Err(SinkError::Transient("HTTP 500".into())),
        ]);
        let accounting = Arc::new(RunAccounting::default());
        let (dispatcher, submitter) = Dispatcher::start(
            &factory,
            single_worker(),
            Arc::default(),
            Arc::clone(&accounting),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        submitter.submit(batch(1)).await.unwrap();
        drop(submitter);
        assert_eq!(dispatcher.finish().await, 0);

        let snapshot = accounting.snapshot();
        assert_eq!(snapshot.batches_succeeded, 1);
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.retries, 2);
        assert_eq!(*factory.calls.lock().unwrap(), vec![1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let factory = ScriptedFactory::new(vec![Err(SinkError::Transient("HTTP 503".into())); 10]);
        let accounting = Arc::new(RunAccounting::default());
        let settings = DispatchSettings {
            max_retries: 2,
            ..single_worker()
        };
        let (dispatcher, submitter) = Dispatcher::start(
            &factory,
            settings,
            Arc::default(),
            Arc::clone(&accounting),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        submitter.submit(batch(1)).await.unwrap();
        drop(submitter);
        dispatcher.finish().await;

        let snapshot = accounting.snapshot();
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.error_examples, vec!["batch 1: HTTP 503".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batch_is_not_retried() {
        let factory = ScriptedFactory::new(vec![Err(SinkError::Rejected("HTTP 422: bad".into()))]);
        let accounting = Arc::new(RunAccounting::default());
        let (dispatcher, submitter) = Dispatcher::start(
            &factory,
            single_worker(),
            Arc::default(),
            Arc::clone(&accounting),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        submitter.submit(batch(1)).await.unwrap();
        submitter.submit(batch(2)).await.unwrap();
        drop(submitter);
        dispatcher.finish().await;

        let snapshot = accounting.snapshot();
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.batches_succeeded, 1);
        assert_eq!(snapshot.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_cancels_and_rejects_submissions() {
        let factory = ScriptedFactory::new(vec![Err(SinkError::Fatal("unauthorized response (401)".into()))]);
        let accounting = Arc::new(RunAccounting::default());
        let cancel = CancellationToken::new();
        let (dispatcher, submitter) = Dispatcher::start(
            &factory,
            single_worker(),
            Arc::default(),
            Arc::clone(&accounting),
            cancel.clone(),
        )
        .await
        .unwrap();

        submitter.submit(batch(1)).await.unwrap();
        cancel.cancelled().await;
        assert!(submitter.submit(batch(2)).await.is_err());
        drop(submitter);
        dispatcher.finish().await;

        let snapshot = accounting.snapshot();
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.batches_abandoned, 1);
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(accounting.abort_reason().as_deref(), Some("unauthorized response (401)"));
        assert_eq!(*factory.calls.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_batches_release_claims() {
        let factory = ScriptedFactory::new(vec![Err(SinkError::Fatal("unauthorized response (403)".into()))]);
        let matches = Arc::new(MatchCache::default());
        let cancel = CancellationToken::new();
        let (dispatcher, submitter) = Dispatcher::start(
            &factory,
            single_worker(),
            Arc::clone(&matches),
            Arc::new(RunAccounting::default()),
            cancel.clone(),
        )
        .await
        .unwrap();

        let key = NormalizedRecord::new("s", "Rice", 130).natural_key;
        matches.claim(&key, 1);
        submitter.submit(batch(1)).await.unwrap();
        cancel.cancelled().await;

        matches.claim(&NormalizedRecord::new("t", "Beans", 130).natural_key, 2);
        let beans = Batch::new(2, vec![NormalizedRecord::new("t", "Beans", 130)]).unwrap();
        assert!(submitter.submit(beans).await.is_err());
        drop(submitter);
        dispatcher.finish().await;

        assert_eq!(matches.claimed(), 0);
    }
}
