//! Fixed-size batching of normalized records

use crate::record::NormalizedRecord;

/// Default number of records per sink write
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// A non-empty run of records, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    id: u64,
    records: Vec<NormalizedRecord>,
}

impl Batch {
    /// `None` when `records` is empty
    pub fn new(id: u64, records: Vec<NormalizedRecord>) -> Option<Self> {
        (!records.is_empty()).then_some(Self { id, records })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Accumulates records and seals them into batches of at most `max_size`.
///
/// Batch ids start at 1 and increase by one per sealed batch.
#[derive(Debug)]
pub struct Batcher {
    max_size: usize,
    open: Vec<NormalizedRecord>,
    next_id: u64,
}

impl Batcher {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            open: Vec::with_capacity(max_size),
            next_id: 1,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Id the open batch will carry once sealed
    pub fn open_id(&self) -> u64 {
        self.next_id
    }

    /// Records waiting in the open batch
    pub fn pending(&self) -> usize {
        self.open.len()
    }

    /// Append a record; returns the sealed batch once the open one is full
    pub fn add(&mut self, record: NormalizedRecord) -> Option<Batch> {
        self.open.push(record);
        if self.open.len() >= self.max_size {
            self.seal()
        } else {
            None
        }
    }

    /// Seal the open batch. Without `force` only a full batch is sealed.
    pub fn flush(&mut self, force: bool) -> Option<Batch> {
        if force || self.open.len() >= self.max_size {
            self.seal()
        } else {
            None
        }
    }

    fn seal(&mut self) -> Option<Batch> {
        let records = std::mem::replace(&mut self.open, Vec::with_capacity(self.max_size));
        let batch = Batch::new(self.next_id, records)?;
        self.next_id += 1;
        Some(batch)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record(n: usize) -> NormalizedRecord {
        NormalizedRecord::new(n.to_string(), format!("Food {n}"), n as i32)
    }

    #[test]
    fn test_sizes_two_two_one() {
        let mut batcher = Batcher::new(2);
        let mut sealed: Vec<Batch> = (0..5).filter_map(|n| batcher.add(record(n))).collect();
        assert_eq!(batcher.pending(), 1);
        sealed.extend(batcher.flush(true));

        let sizes: Vec<_> = sealed.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let ids: Vec<_> = sealed.iter().map(Batch::id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_preserves_arrival_order() {
        let mut batcher = Batcher::new(3);
        let mut sealed = Vec::new();
        for n in 0..7 {
            sealed.extend(batcher.add(record(n)));
        }
        sealed.extend(batcher.flush(true));

        let order: Vec<_> = sealed
            .iter()
            .flat_map(|b| b.records().iter().map(|r| r.source_id.clone()))
            .collect();
        assert_eq!(order, vec!["0", "1", "2", "3", "4", "5", "6"]);
        assert!(sealed.iter().all(|b| (1..=3).contains(&b.len())));
    }

    #[test]
    fn test_flush_never_seals_empty_batch() {
        let mut batcher = Batcher::new(2);
        assert!(batcher.flush(true).is_none());

        batcher.add(record(1));
        assert!(batcher.flush(false).is_none());
        assert_eq!(batcher.flush(true).unwrap().len(), 1);
        assert!(batcher.flush(true).is_none());
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let mut batcher = Batcher::new(0);
        assert_eq!(batcher.max_size(), 1);
        assert_eq!(batcher.add(record(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_open_id_follows_sealed_batches() {
        let mut batcher = Batcher::new(2);
        assert_eq!(batcher.open_id(), 1);
        batcher.add(record(1));
        assert_eq!(batcher.open_id(), 1);
        let sealed = batcher.add(record(2)).unwrap();
        assert_eq!(sealed.id(), 1);
        assert_eq!(batcher.open_id(), 2);
    }

    #[test]
    fn test_batch_rejects_empty() {
        assert!(Batch::new(1, Vec::new()).is_none());
    }
}
