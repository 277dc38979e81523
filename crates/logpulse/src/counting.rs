// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-key concurrent event counters and their per-cycle diffs.
//!
//! Producers only ever increment. The flush task keeps the last observed total
//! per (key, label) and turns the monotonically growing counts into deltas, so
//! an increment racing a diff is simply reported by the next cycle.

use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;

/// Label totals of one routing key.
#[derive(Debug)]
pub struct SyncEventCounter<L: Eq + Hash> {
    counts: DashMap<L, AtomicI64, FnvBuildHasher>,
}

impl<L: Eq + Hash + Clone> Default for SyncEventCounter<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Eq + Hash + Clone> SyncEventCounter<L> {
    #[must_use]
    pub fn new() -> Self {
        SyncEventCounter {
            counts: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    pub fn increment(&self, label: L) {
        if let Some(count) = self.counts.get(&label) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counts
            .entry(label)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self, label: &L) -> i64 {
        self.counts
            .get(label)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Returns the positive deltas since `last` and advances `last` to the
    /// totals just observed. `None` when no label changed.
    pub fn diff(&self, last: &mut HashMap<L, i64>) -> Option<HashMap<L, i64>> {
        let mut deltas = HashMap::new();
        for entry in self.counts.iter() {
            let current = entry.value().load(Ordering::Relaxed);
            let previous = last.entry(entry.key().clone()).or_insert(0);
            let delta = current - *previous;
            *previous = current;
            if delta > 0 {
                deltas.insert(entry.key().clone(), delta);
            }
        }
        if deltas.is_empty() {
            None
        } else {
            Some(deltas)
        }
    }
}

/// Counters for every routing key seen so far. Keys are created lazily and
/// never evicted.
#[derive(Debug)]
pub struct EventCounter<K: Eq + Hash, L: Eq + Hash> {
    keys: DashMap<K, SyncEventCounter<L>, FnvBuildHasher>,
}

impl<K, L> Default for EventCounter<K, L>
where
    K: Eq + Hash + Clone,
    L: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, L> EventCounter<K, L>
where
    K: Eq + Hash + Clone,
    L: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        EventCounter {
            keys: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    pub fn increment(&self, key: K, label: L) {
        if let Some(counter) = self.keys.get(&key) {
            counter.increment(label);
            return;
        }
        self.keys.entry(key).or_default().increment(label);
    }

    #[must_use]
    pub fn count(&self, key: &K, label: &L) -> i64 {
        self.keys.get(key).map_or(0, |counter| counter.count(label))
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn diff(&self, key: &K, last: &mut HashMap<L, i64>) -> Option<HashMap<L, i64>> {
        self.keys.get(key).and_then(|counter| counter.diff(last))
    }

    /// Diffs every key against its snapshot in `snapshots`.
    pub fn diff_all(
        &self,
        snapshots: &mut HashMap<K, HashMap<L, i64>>,
    ) -> Vec<(K, HashMap<L, i64>)> {
        let mut changed = Vec::new();
        for entry in self.keys.iter() {
            let last = snapshots.entry(entry.key().clone()).or_default();
            if let Some(deltas) = entry.value().diff(last) {
                changed.push((entry.key().clone(), deltas));
            }
        }
        changed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_diff_reports_only_changes() {
        let counter = SyncEventCounter::new();
        let mut last = HashMap::new();

        assert!(counter.diff(&mut last).is_none());

        counter.increment("WARN");
        counter.increment("WARN");
        counter.increment("ERROR");
        let deltas = counter.diff(&mut last).unwrap();
        assert_eq!(deltas.get("WARN"), Some(&2));
        assert_eq!(deltas.get("ERROR"), Some(&1));

        counter.increment("WARN");
        let deltas = counter.diff(&mut last).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas.get("WARN"), Some(&1));

        assert!(counter.diff(&mut last).is_none());
        assert_eq!(last.get("WARN"), Some(&3));
    }

    #[test]
    fn test_event_counter_keys_are_independent() {
        let counter = EventCounter::new();
        counter.increment("db", "ERROR");
        counter.increment("http", "ERROR");
        counter.increment("http", "INFO");

        assert_eq!(counter.key_count(), 2);
        assert_eq!(counter.count(&"http", &"ERROR"), 1);

        let mut snapshots = HashMap::new();
        let mut changed = counter.diff_all(&mut snapshots);
        changed.sort_by_key(|(key, _)| *key);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].0, "db");
        assert_eq!(changed[1].1.get("INFO"), Some(&1));

        assert!(counter.diff_all(&mut snapshots).is_empty());
    }

    #[test]
    fn test_diff_unknown_key() {
        let counter: EventCounter<&str, &str> = EventCounter::new();
        let mut last = HashMap::new();
        assert!(counter.diff(&"missing", &mut last).is_none());
    }

    #[test]
    fn test_concurrent_increments_are_conserved() {
        let counter = Arc::new(EventCounter::new());
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        counter.increment(i % 3, "INFO");
                    }
                })
            })
            .collect();

        let mut snapshots = HashMap::new();
        let mut total = 0;
        for _ in 0..20 {
            for (_, deltas) in counter.diff_all(&mut snapshots) {
                assert!(deltas.values().all(|delta| *delta > 0));
                total += deltas.values().sum::<i64>();
            }
            thread::yield_now();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        for (_, deltas) in counter.diff_all(&mut snapshots) {
            total += deltas.values().sum::<i64>();
        }

        assert_eq!(total, 4_000);
    }

    proptest! {
        #[test]
        fn prop_deltas_sum_to_increments(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let counter = SyncEventCounter::new();
            let mut last = HashMap::new();
            let mut increments = 0i64;
            let mut reported = 0i64;
            for increment in ops {
                if increment {
                    counter.increment("L");
                    increments += 1;
                } else if let Some(deltas) = counter.diff(&mut last) {
                    prop_assert!(deltas.values().all(|delta| *delta > 0));
                    reported += deltas.values().sum::<i64>();
                }
            }
            if let Some(deltas) = counter.diff(&mut last) {
                reported += deltas.values().sum::<i64>();
            }
            prop_assert_eq!(reported, increments);
        }
    }
}
