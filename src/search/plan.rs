//! Search state carried between iterations.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::sketch::{BatchId, TableId};

/// One selected feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub seller_id: TableId,
    /// 1-based iteration in which the feature was selected.
    pub iteration: usize,
    pub seller_name: String,
    pub feature_name: String,
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} (seller {} `{}`)",
            self.iteration, self.feature_name, self.seller_id, self.seller_name
        )
    }
}

/// Ordered, append-only record of selected features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AugmentationPlan {
    entries: Vec<PlanEntry>,
}

impl AugmentationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: PlanEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter()
    }

    /// Names of the selected features, in selection order.
    pub fn feature_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.feature_name.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a AugmentationPlan {
    type Item = &'a PlanEntry;
    type IntoIter = std::slice::Iter<'a, PlanEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Batch-local feature indices grouped by `(join_key, batch_id)`.
///
/// Batch ids are only unique within one join key's store, hence the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    inner: HashMap<(String, BatchId), BTreeSet<usize>>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an index, returning `true` if it was not present.
    pub fn insert(&mut self, join_key: &str, batch_id: BatchId, index: usize) -> bool {
        self.inner
            .entry((join_key.to_owned(), batch_id))
            .or_default()
            .insert(index)
    }

    pub fn contains(&self, join_key: &str, batch_id: BatchId, index: usize) -> bool {
        self.get(join_key, batch_id)
            .is_some_and(|set| set.contains(&index))
    }

    /// Indices recorded for one batch.
    pub fn get(&self, join_key: &str, batch_id: BatchId) -> Option<&BTreeSet<usize>> {
        self.inner.get(&(join_key.to_owned(), batch_id))
    }

    /// Total number of recorded indices.
    pub fn len(&self) -> usize {
        self.inner.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Features whose normal equations were singular. They are never retried.
pub type UnusableSet = FeatureSet;

/// Features already selected, masked out of later iterations.
pub type SelectedSet = FeatureSet;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_set_is_keyed_by_join_key_and_batch() {
        let mut set = FeatureSet::new();
        assert!(set.insert("zip", 0, 3));
        assert!(!set.insert("zip", 0, 3));
        assert!(set.insert("year", 0, 3));

        assert!(set.contains("zip", 0, 3));
        assert!(!set.contains("zip", 1, 3));
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("year", 0).unwrap().len(), 1);
    }

    #[test]
    fn plan_preserves_order() {
        let mut plan = AugmentationPlan::new();
        for (i, name) in ["a", "b"].iter().enumerate() {
            plan.push(PlanEntry {
                seller_id: i,
                iteration: i + 1,
                seller_name: "s".into(),
                feature_name: name.to_string(),
            });
        }
        assert_eq!(plan.feature_names(), vec!["a", "b"]);
        assert_eq!(plan.entries()[1].iteration, 2);
        assert_eq!(plan.entries()[0].to_string(), "#1 a (seller 0 `s`)");
    }
}
