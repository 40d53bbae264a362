//! Shared fixtures for the integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use nutri_ingest::batch::Batch;
use nutri_ingest::config::PipelineSettings;
use nutri_ingest::error::SinkError;
use nutri_ingest::match_cache::MatchCache;
use nutri_ingest::sink::{BatchReceipt, Sink, SinkFactory};
use nutri_ingest::{NaturalKey, SinkId};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Preamble lines the MyFoodData export carries above its header
pub const MYFOODDATA_PREAMBLE: &str = "MyFoodData Nutrition Facts SpreadSheet\nVisit MyFoodData.com\nRelease 1.4\n";

pub fn write_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// A MyFoodData export with `ID,Name,Food Group,Calories` columns
pub fn myfooddata_file(rows: &[(&str, &str, &str)]) -> NamedTempFile {
    let mut contents = String::from(MYFOODDATA_PREAMBLE);
    contents.push_str("ID,Name,Food Group,Calories\n");
    for (id, name, calories) in rows {
        contents.push_str(&format!("{id},{name},Fruits,{calories}\n"));
    }
    write_file(&contents)
}

/// An OpenFoodFacts dump with `code`, `product_name` and energy columns
pub fn openfoodfacts_file(rows: &[(&str, &str, &str)]) -> NamedTempFile {
    let mut contents = String::from("code\tproduct_name\tbrands\tenergy-kcal_100g\n");
    for (code, name, kcal) in rows {
        contents.push_str(&format!("{code}\t{name}\tAcme\t{kcal}\n"));
    }
    write_file(&contents)
}

pub fn settings(batch_size: usize, workers: usize, max_inflight: usize) -> PipelineSettings {
    PipelineSettings {
        batch_size,
        workers,
        max_inflight,
        retry_backoff_ms: 10,
        ..PipelineSettings::default()
    }
}

/// What a [`ScriptedSink`] does with one batch
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    SucceedAfter(Duration),
    Fail(SinkError),
}

type Script = dyn Fn(u64, u32) -> Step + Send + Sync;

/// Sink whose outcome is chosen per `(batch id, attempt)`; records every
/// call as `(batch id, batch size)`
#[derive(Clone)]
pub struct ScriptedFactory {
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<(u64, usize)>>>,
}

impl ScriptedFactory {
    pub fn new(script: impl Fn(u64, u32) -> Step + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Batch ids of every call, sorted
    pub fn calls(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.calls.lock().unwrap().iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// `(batch id, size)` of every call, sorted
    pub fn sizes(&self) -> Vec<(u64, usize)> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort_unstable();
        calls
    }
}

#[async_trait]
impl SinkFactory for ScriptedFactory {
    type Sink = ScriptedSink;

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, _worker: usize) -> Result<ScriptedSink, SinkError> {
        Ok(ScriptedSink {
            factory: self.clone(),
        })
    }
}

pub struct ScriptedSink {
    factory: ScriptedFactory,
}

#[async_trait]
impl Sink for ScriptedSink {
    async fn write_batch(&mut self, batch: &Batch, _matches: &MatchCache) -> Result<BatchReceipt, SinkError> {
        let attempt = {
            let mut calls = self.factory.calls.lock().unwrap();
            calls.push((batch.id(), batch.len()));
            calls.iter().filter(|(id, _)| *id == batch.id()).count() as u32
        };

        match (self.factory.script)(batch.id(), attempt) {
            Step::Succeed => Ok(BatchReceipt::default()),
            Step::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(BatchReceipt::default())
            },
            Step::Fail(err) => Err(err),
        }
    }
}

/// Sink that looks a key up, yields, then inserts, without any lock held
/// across the await. Two writers of one key at the same time both insert.
#[derive(Clone)]
pub struct RacyFactory {
    delay: Duration,
    rows: Arc<Mutex<Vec<(NaturalKey, SinkId)>>>,
    inflight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RacyFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            rows: Arc::new(Mutex::new(Vec::new())),
            inflight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn rows(&self) -> Vec<(NaturalKey, SinkId)> {
        self.rows.lock().unwrap().clone()
    }

    /// Most batches written at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkFactory for RacyFactory {
    type Sink = RacySink;

    fn name(&self) -> &'static str {
        "racy"
    }

    async fn connect(&self, _worker: usize) -> Result<RacySink, SinkError> {
        Ok(RacySink {
            factory: self.clone(),
        })
    }
}

pub struct RacySink {
    factory: RacyFactory,
}

impl RacySink {
    fn find(&self, key: &NaturalKey) -> Option<SinkId> {
        let rows = self.factory.rows.lock().unwrap();
        rows.iter().find(|(k, _)| k == key).map(|(_, id)| *id)
    }

    fn insert(&self, key: &NaturalKey) -> SinkId {
        let mut rows = self.factory.rows.lock().unwrap();
        let id = SinkId(rows.len() as i64 + 1);
        rows.push((key.clone(), id));
        id
    }
}

#[async_trait]
impl Sink for RacySink {
    async fn write_batch(&mut self, batch: &Batch, _matches: &MatchCache) -> Result<BatchReceipt, SinkError> {
        let now = self.factory.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.factory.peak.fetch_max(now, Ordering::SeqCst);

        let mut receipt = BatchReceipt::default();
        for record in batch.records() {
            let existing = record.matched.or_else(|| self.find(&record.natural_key));
            tokio::time::sleep(self.factory.delay).await;
            match existing {
                Some(_) => receipt.matched += 1,
                None => {
                    let id = self.insert(&record.natural_key);
                    receipt.created.push((record.natural_key.clone(), id));
                },
            }
        }

        self.factory.inflight.fetch_sub(1, Ordering::SeqCst);
        Ok(receipt)
    }
}
