//! In-process sink
//!
//! Mirrors the database sink's semantics (upsert on source id, natural-key
//! matching, measurements deduplicated by abbreviation, barcode upsert)
//! without a server. Used by `--dry-run` and in tests.

use super::{BatchReceipt, PortionStore, Sink, SinkFactory};
use crate::batch::Batch;
use crate::error::SinkError;
use crate::match_cache::MatchCache;
use crate::record::{Measurement, NaturalKey, NormalizedRecord, SinkId};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A food as stored by [`MemoryStore`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFood {
    pub id: SinkId,
    pub record: NormalizedRecord,
    pub measurements: Vec<Measurement>,
}

/// Foods live at `id - 1`; every lookup goes through an index
#[derive(Debug, Default)]
struct Tables {
    foods: Vec<StoredFood>,
    by_source_id: HashMap<String, SinkId>,
    by_key: HashMap<NaturalKey, BTreeSet<SinkId>>,
    barcodes: HashMap<String, SinkId>,
}

impl Tables {
    fn index(id: SinkId) -> Option<usize> {
        usize::try_from(id.0).ok()?.checked_sub(1)
    }

    fn food(&self, id: SinkId) -> Option<&StoredFood> {
        self.foods.get(Self::index(id)?)
    }

    fn food_mut(&mut self, id: SinkId) -> Option<&mut StoredFood> {
        self.foods.get_mut(Self::index(id)?)
    }

    fn find_by_key(&self, key: &NaturalKey) -> Option<SinkId> {
        self.by_key.get(key).and_then(|ids| ids.first()).copied()
    }

    fn upsert(&mut self, record: &NormalizedRecord) -> SinkId {
        if let Some(&id) = self.by_source_id.get(&record.source_id) {
            let Some(food) = self.food_mut(id) else {
                return id;
            };
            let previous_key = food.record.natural_key.clone();
            let is_csv_food = food.record.is_csv_food || record.is_csv_food;
            food.record = record.clone();
            food.record.is_csv_food = is_csv_food;

            if previous_key != record.natural_key {
                if let Some(ids) = self.by_key.get_mut(&previous_key) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.by_key.remove(&previous_key);
                    }
                }
                self.by_key.entry(record.natural_key.clone()).or_default().insert(id);
            }
            return id;
        }

        let id = SinkId(self.foods.len() as i64 + 1);
        self.by_source_id.insert(record.source_id.clone(), id);
        self.by_key.entry(record.natural_key.clone()).or_default().insert(id);
        self.foods.push(StoredFood {
            id,
            record: record.clone(),
            measurements: Vec::new(),
        });
        id
    }

    /// Add measurements whose abbreviation the food does not have yet; returns how many were added
    fn ensure_measurements<'a, I>(&mut self, id: SinkId, measurements: I) -> u64
    where
        I: IntoIterator<Item = &'a Measurement>,
    {
        let Some(food) = self.food_mut(id) else {
            return 0;
        };
        let mut added = 0;
        for measurement in measurements {
            if !food.measurements.iter().any(|m| m.abbreviation == measurement.abbreviation) {
                food.measurements.push(measurement.clone());
                added += 1;
            }
        }
        added
    }
}

/// Shared state behind every [`MemorySink`] of one factory
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `(natural key, id)` of every stored food in id order, for warming a match cache
    pub fn identities(&self) -> Vec<(NaturalKey, SinkId)> {
        self.tables()
            .foods
            .iter()
            .map(|food| (food.record.natural_key.clone(), food.id))
            .collect()
    }

    pub fn food(&self, id: SinkId) -> Option<StoredFood> {
        self.tables().food(id).cloned()
    }

    pub fn foods(&self) -> Vec<StoredFood> {
        self.tables().foods.clone()
    }

    pub fn len(&self) -> usize {
        self.tables().foods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables().foods.is_empty()
    }

    pub fn barcode(&self, barcode: &str) -> Option<SinkId> {
        self.tables().barcodes.get(barcode).copied()
    }
}

/// Factory handing out sinks over one shared [`MemoryStore`]
#[derive(Debug, Default, Clone)]
pub struct MemorySinkFactory {
    store: MemoryStore,
}

impl MemorySinkFactory {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl SinkFactory for MemorySinkFactory {
    type Sink = MemorySink;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, _worker: usize) -> Result<MemorySink, SinkError> {
        Ok(MemorySink {
            store: self.store.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemorySink {
    store: MemoryStore,
}

#[async_trait]
impl Sink for MemorySink {
    async fn write_batch(&mut self, batch: &Batch, matches: &MatchCache) -> Result<BatchReceipt, SinkError> {
        // Nothing below can fail, so the batch is applied in one critical section
        let mut tables = self.store.tables();
        let mut receipt = BatchReceipt::default();
        let mut created_here: HashMap<NaturalKey, SinkId> = HashMap::new();

        for record in batch.records() {
            let key = &record.natural_key;
            let known = record
                .matched
                .or_else(|| created_here.get(key).copied())
                .or_else(|| matches.lookup(key))
                .or_else(|| tables.find_by_key(key));

            let id = match known {
                Some(id) => {
                    receipt.matched += 1;
                    id
                },
                None => {
                    let id = tables.upsert(record);
                    created_here.insert(key.clone(), id);
                    receipt.created.push((key.clone(), id));
                    id
                },
            };

            tables.ensure_measurements(id, &record.measurements);
            if let Some(barcode) = &record.barcode {
                tables.barcodes.insert(barcode.clone(), id);
            }
        }

        Ok(receipt)
    }
}

#[async_trait]
impl PortionStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn food_ids(&mut self, source_ids: &[String]) -> Result<HashMap<String, SinkId>, SinkError> {
        let tables = self.tables();
        Ok(source_ids
            .iter()
            .filter_map(|source_id| Some((source_id.clone(), *tables.by_source_id.get(source_id)?)))
            .collect())
    }

    async fn attach(&mut self, portions: &[(SinkId, Measurement)]) -> Result<u64, SinkError> {
        let mut tables = self.tables();
        Ok(portions
            .iter()
            .map(|(id, measurement)| tables.ensure_measurements(*id, [measurement]))
            .sum())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn batch(id: u64, records: Vec<NormalizedRecord>) -> Batch {
        Batch::new(id, records).unwrap()
    }

    #[tokio::test]
    async fn test_duplicates_within_batch_share_identity() {
        let factory = MemorySinkFactory::default();
        let mut sink = factory.connect(0).await.unwrap();
        let matches = MatchCache::default();

        let receipt = sink
            .write_batch(
                &batch(
                    1,
                    vec![
                        NormalizedRecord::new("a", "Apple", 52),
                        NormalizedRecord::new("b", "apple", 52),
                    ],
                ),
                &matches,
            )
            .await
            .unwrap();

        assert_eq!(receipt.created, vec![(NaturalKey::new("apple", 52), SinkId(1))]);
        assert_eq!(receipt.matched, 1);
        assert_eq!(factory.store().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_on_source_id() {
        let factory = MemorySinkFactory::default();
        let mut sink = factory.connect(0).await.unwrap();
        let matches = MatchCache::default();

        let mut first = NormalizedRecord::new("src-1", "Oats", 375);
        first.barcode = Some("123".into());
        sink.write_batch(&batch(1, vec![first]), &matches).await.unwrap();

        // Same source id, different natural key: updated in place
        let second = NormalizedRecord::new("src-1", "Rolled Oats", 380);
        let receipt = sink.write_batch(&batch(2, vec![second]), &matches).await.unwrap();

        assert_eq!(receipt.created[0].1, SinkId(1));
        let foods = factory.store().foods();
        assert_eq!(foods.len(), 1);
        assert_eq!(foods[0].record.name, "Rolled Oats");
        assert_eq!(foods[0].measurements.len(), 2);
        assert_eq!(factory.store().barcode("123"), Some(SinkId(1)));
    }

    #[tokio::test]
    async fn test_matched_record_adds_measurements_only() {
        let factory = MemorySinkFactory::default();
        let mut sink = factory.connect(0).await.unwrap();
        let matches = MatchCache::default();
        sink.write_batch(&batch(1, vec![NormalizedRecord::new("a", "Bread", 265)]), &matches)
            .await
            .unwrap();

        let mut duplicate = NormalizedRecord::new("b", "Bread", 265).with_matched(Some(SinkId(1)));
        duplicate.measurements.push(Measurement {
            name: "1 slice".into(),
            abbreviation: "slice".into(),
            unit: "slice".into(),
            weight_in_grams: 28.0,
            is_default: false,
            is_from_source: true,
        });
        let receipt = sink.write_batch(&batch(2, vec![duplicate]), &matches).await.unwrap();

        assert!(receipt.created.is_empty());
        assert_eq!(receipt.matched, 1);
        let foods = factory.store().foods();
        assert_eq!(foods.len(), 1);
        assert_eq!(foods[0].measurements.len(), 3);
        assert_eq!(factory.store().identities(), vec![(NaturalKey::new("bread", 265), SinkId(1))]);
    }

    #[tokio::test]
    async fn test_renamed_food_releases_its_old_key() {
        let factory = MemorySinkFactory::default();
        let mut sink = factory.connect(0).await.unwrap();
        let matches = MatchCache::default();
        sink.write_batch(&batch(1, vec![NormalizedRecord::new("src-1", "Oats", 375)]), &matches)
            .await
            .unwrap();
        sink.write_batch(&batch(2, vec![NormalizedRecord::new("src-1", "Rolled Oats", 380)]), &matches)
            .await
            .unwrap();

        let receipt = sink
            .write_batch(&batch(3, vec![NormalizedRecord::new("src-2", "Oats", 375)]), &matches)
            .await
            .unwrap();
        assert_eq!(receipt.created, vec![(NaturalKey::new("oats", 375), SinkId(2))]);

        let receipt = sink
            .write_batch(&batch(4, vec![NormalizedRecord::new("src-3", "rolled oats", 380)]), &matches)
            .await
            .unwrap();
        assert_eq!(receipt.matched, 1);
        assert_eq!(factory.store().len(), 2);
    }

    #[tokio::test]
    async fn test_many_batches_keep_indices_consistent() {
        let factory = MemorySinkFactory::default();
        let mut sink = factory.connect(0).await.unwrap();
        let matches = MatchCache::default();

        for batch_id in 1..=400u64 {
            let records = (0..25)
                .map(|i| {
                    let n = (batch_id - 1) * 25 + i;
                    NormalizedRecord::new(format!("src-{n}"), format!("Food {}", n % 5000), 100)
                })
                .collect();
            sink.write_batch(&batch(batch_id, records), &matches).await.unwrap();
        }

        let store = factory.store();
        assert_eq!(store.len(), 5000);
        let food = store.food(SinkId(4321)).unwrap();
        assert_eq!(food.record.source_id, "src-4320");
        assert_eq!(store.identities().last().unwrap().1, SinkId(5000));
        assert!(store.food(SinkId(5001)).is_none());
        assert!(store.food(SinkId(0)).is_none());
    }

    #[tokio::test]
    async fn test_portions_attach_by_source_id() {
        let factory = MemorySinkFactory::default();
        let mut sink = factory.connect(0).await.unwrap();
        sink.write_batch(&batch(1, vec![NormalizedRecord::new("100", "Apple", 52)]), &MatchCache::default())
            .await
            .unwrap();

        let mut store = factory.store().clone();
        let ids = store.food_ids(&["100".to_string(), "404".to_string()]).await.unwrap();
        assert_eq!(ids, HashMap::from([("100".to_string(), SinkId(1))]));

        let cup = Measurement {
            name: "1 cup".into(),
            abbreviation: "cup".into(),
            unit: "cup".into(),
            weight_in_grams: 125.0,
            is_default: false,
            is_from_source: true,
        };
        let added = store.attach(&[(SinkId(1), cup.clone()), (SinkId(1), cup)]).await.unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.food(SinkId(1)).unwrap().measurements.len(), 3);
    }
}
