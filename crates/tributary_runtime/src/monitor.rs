//! Per-submission statistics counters.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tributary_core::SubmissionId;

/// Name of the counter bumped for every chain created at runtime
pub const CHAINS_DYNAMICALLY_GENERATED: &str = "Chains Dynamically Generated";

/// Named counters of one submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    counters: BTreeMap<String, i64>,
}

impl SubmissionStats {
    /// Value of a counter, zero if never touched
    #[must_use]
    pub fn get(&self, name: &str) -> i64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Iterate over counters in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Whether no counter was touched
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Statistics collector of one node
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    submissions: Mutex<HashMap<SubmissionId, SubmissionStats>>,
}

impl StatisticsCollector {
    /// Create an empty collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to a counter
    pub fn add_counter(&self, submission: SubmissionId, name: &str, value: i64) {
        *self
            .submissions
            .lock()
            .entry(submission)
            .or_default()
            .counters
            .entry(name.to_string())
            .or_insert(0) += value;
    }

    /// Value of a counter
    #[must_use]
    pub fn counter(&self, submission: SubmissionId, name: &str) -> i64 {
        self.submissions
            .lock()
            .get(&submission)
            .map_or(0, |stats| stats.get(name))
    }

    /// Snapshot of a submission's counters
    #[must_use]
    pub fn snapshot(&self, submission: SubmissionId) -> SubmissionStats {
        self.submissions
            .lock()
            .get(&submission)
            .cloned()
            .unwrap_or_default()
    }

    /// Fold another snapshot into a submission's counters
    pub fn merge(&self, submission: SubmissionId, other: &SubmissionStats) {
        let mut submissions = self.submissions.lock();
        let stats = submissions.entry(submission).or_default();
        for (name, value) in other.iter() {
            *stats.counters.entry(name.to_string()).or_insert(0) += value;
        }
    }

    /// Drop a submission's counters, returning them
    pub fn remove(&self, submission: SubmissionId) -> SubmissionStats {
        self.submissions
            .lock()
            .remove(&submission)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_counter() {
        let stats = StatisticsCollector::new();
        let sub = SubmissionId::new(1);
        stats.add_counter(sub, CHAINS_DYNAMICALLY_GENERATED, 1);
        stats.add_counter(sub, CHAINS_DYNAMICALLY_GENERATED, 2);
        assert_eq!(stats.counter(sub, CHAINS_DYNAMICALLY_GENERATED), 3);
        assert_eq!(stats.counter(SubmissionId::new(2), CHAINS_DYNAMICALLY_GENERATED), 0);
    }

    #[test]
    fn test_merge_and_remove() {
        let stats = StatisticsCollector::new();
        let sub = SubmissionId::new(1);
        stats.add_counter(sub, "tuples", 5);

        let other = StatisticsCollector::new();
        other.add_counter(sub, "tuples", 2);
        other.add_counter(sub, "chains", 1);
        stats.merge(sub, &other.snapshot(sub));

        let snapshot = stats.remove(sub);
        assert_eq!(snapshot.get("tuples"), 7);
        assert_eq!(snapshot.get("chains"), 1);
        assert!(stats.snapshot(sub).is_empty());
    }
}
