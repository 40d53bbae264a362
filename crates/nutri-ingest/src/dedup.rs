//! Duplicate food detection
//!
//! Foods sharing a natural key are duplicates. The lowest id of each group
//! stays canonical; the `merge-duplicates` command moves measurements and
//! barcodes of the others onto it and removes them.

use crate::record::{NaturalKey, SinkId};
use serde::Serialize;
use std::collections::HashMap;

/// Foods that share one natural key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: NaturalKey,
    pub canonical: SinkId,
    /// Ascending, never empty, all greater than `canonical`
    pub duplicates: Vec<SinkId>,
}

impl DuplicateGroup {
    pub fn duplicate_ids(&self) -> Vec<i64> {
        self.duplicates.iter().map(|id| id.0).collect()
    }
}

/// Group `identities` by natural key, keeping only keys held by more than one food.
///
/// Groups come back ordered by their canonical id.
pub fn find_duplicates<I>(identities: I) -> Vec<DuplicateGroup>
where
    I: IntoIterator<Item = (NaturalKey, SinkId)>,
{
    let mut by_key: HashMap<NaturalKey, Vec<SinkId>> = HashMap::new();
    for (key, id) in identities {
        by_key.entry(key).or_default().push(id);
    }

    let mut groups: Vec<DuplicateGroup> = by_key
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(key, mut ids)| {
            ids.sort_unstable();
            ids.dedup();
            let canonical = ids.remove(0);
            DuplicateGroup {
                key,
                canonical,
                duplicates: ids,
            }
        })
        .filter(|group| !group.duplicates.is_empty())
        .collect();
    groups.sort_by_key(|group| group.canonical);
    groups
}

/// What merging one or more groups changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeTotals {
    pub groups: u64,
    pub foods_removed: u64,
    pub measurements_moved: u64,
    /// Measurements dropped because the canonical food already had the abbreviation
    pub measurements_dropped: u64,
    pub barcodes_moved: u64,
}

impl MergeTotals {
    /// Groups and foods a merge of `groups` would remove; measurement counts stay zero
    pub fn planned(groups: &[DuplicateGroup]) -> Self {
        Self {
            groups: groups.len() as u64,
            foods_removed: groups.iter().map(|group| group.duplicates.len() as u64).sum(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, other: &MergeTotals) {
        self.groups += other.groups;
        self.foods_removed += other.foods_removed;
        self.measurements_moved += other.measurements_moved;
        self.measurements_dropped += other.measurements_dropped;
        self.barcodes_moved += other.barcodes_moved;
    }
}
