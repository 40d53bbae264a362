//! Natural-key matching against foods that already exist in the store
//!
//! Two maps sit behind one mutex:
//!
//! - the **authoritative** map, bulk-loaded once by [`MatchCache::warm`] and
//!   extended by [`MatchCache::record`]; it is never cleared.
//! - a **write-through cache** of recent hits and new identities. Once it
//!   grows past the threshold it is emptied in one go rather than evicted
//!   entry by entry. Lookups after a clear fall through to the
//!   authoritative map, so correctness does not depend on the cache.
//!
//! Keys that were not found when the producer saw them are **claimed** by
//! the batch that will create them. A later batch holding the same key
//! waits in [`MatchCache::settle`] until the owning batch is released, so
//! only one in-flight write can create a given key.

use crate::batch::Batch;
use crate::record::{NaturalKey, SinkId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// Entries the write-through cache may hold before it is cleared
pub const DEFAULT_CACHE_CLEAR_THRESHOLD: usize = 50_000;

#[derive(Debug, Default)]
struct Maps {
    cache: HashMap<NaturalKey, SinkId>,
    authoritative: HashMap<NaturalKey, SinkId>,
    /// Unresolved key -> id of the batch that will create it
    claims: HashMap<NaturalKey, u64>,
    clears: u64,
}

/// Shared between the producer (lookups) and dispatch workers (records)
#[derive(Debug)]
pub struct MatchCache {
    maps: Mutex<Maps>,
    released: Notify,
    clear_threshold: usize,
}

impl Default for MatchCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CLEAR_THRESHOLD)
    }
}

impl MatchCache {
    pub fn new(clear_threshold: usize) -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            released: Notify::new(),
            clear_threshold: clear_threshold.max(1),
        }
    }

    fn maps(&self) -> MutexGuard<'_, Maps> {
        // Every critical section leaves both maps consistent, so poisoning is ignored
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load existing `(key, id)` pairs into the authoritative map.
    ///
    /// May be called repeatedly with consecutive pages of one scan. The
    /// first id seen for a key wins. Returns the number of new keys.
    pub fn warm<I>(&self, rows: I) -> usize
    where
        I: IntoIterator<Item = (NaturalKey, SinkId)>,
    {
        let mut maps = self.maps();
        let before = maps.authoritative.len();
        for (key, id) in rows {
            maps.authoritative.entry(key).or_insert(id);
        }
        maps.authoritative.len() - before
    }

    /// Existing identity for `key`, checking the cache before the authoritative map
    pub fn lookup(&self, key: &NaturalKey) -> Option<SinkId> {
        let mut maps = self.maps();
        if let Some(id) = maps.cache.get(key) {
            return Some(*id);
        }

        let id = *maps.authoritative.get(key)?;
        self.cache_insert(&mut maps, key.clone(), id);
        Some(id)
    }

    /// Remember the identity created for `key`.
    ///
    /// If another worker already recorded an identity for the key, that one
    /// stays canonical and is returned.
    pub fn record(&self, key: NaturalKey, id: SinkId) -> SinkId {
        let mut maps = self.maps();
        let canonical = *maps.authoritative.entry(key.clone()).or_insert(id);
        self.cache_insert(&mut maps, key, canonical);
        canonical
    }

    /// Claim creation of `key` for batch `batch_id`.
    ///
    /// Returns the owning batch: `batch_id` itself, or the earlier batch
    /// that already claimed the key.
    pub fn claim(&self, key: &NaturalKey, batch_id: u64) -> u64 {
        let mut maps = self.maps();
        *maps.claims.entry(key.clone()).or_insert(batch_id)
    }

    /// Keys of `batch` that an earlier, unreleased batch is creating
    pub fn blocked_on(&self, batch: &Batch) -> Vec<u64> {
        let maps = self.maps();
        let mut owners: Vec<u64> = batch
            .records()
            .iter()
            .filter(|record| record.matched.is_none())
            .filter_map(|record| maps.claims.get(&record.natural_key).copied())
            .filter(|owner| *owner < batch.id())
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Wait until every batch `batch` depends on has been released
    pub async fn settle(&self, batch: &Batch) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let owners = self.blocked_on(batch);
            if owners.is_empty() {
                return;
            }
            debug!(batch_id = batch.id(), ?owners, "Waiting for batches creating the same foods");
            released.await;
        }
    }

    /// Drop the claims held by `batch` and wake waiting batches.
    ///
    /// Called once the batch has finished, failed or been abandoned. On
    /// success the created identities must be recorded first.
    pub fn release(&self, batch: &Batch) {
        let released = {
            let mut maps = self.maps();
            let before = maps.claims.len();
            for record in batch.records() {
                if maps.claims.get(&record.natural_key) == Some(&batch.id()) {
                    maps.claims.remove(&record.natural_key);
                }
            }
            before - maps.claims.len()
        };
        if released > 0 {
            self.released.notify_waiters();
        }
    }

    /// Keys currently claimed by unreleased batches
    pub fn claimed(&self) -> usize {
        self.maps().claims.len()
    }

    fn cache_insert(&self, maps: &mut Maps, key: NaturalKey, id: SinkId) {
        maps.cache.insert(key, id);
        if maps.cache.len() > self.clear_threshold {
            maps.cache.clear();
            maps.clears += 1;
            debug!(
                threshold = self.clear_threshold,
                clears = maps.clears,
                "Match cache cleared"
            );
        }
    }

    pub fn cache_len(&self) -> usize {
        self.maps().cache.len()
    }

    pub fn authoritative_len(&self) -> usize {
        self.maps().authoritative.len()
    }

    /// How many times the cache has been emptied
    pub fn clears(&self) -> u64 {
        self.maps().clears
    }
}
