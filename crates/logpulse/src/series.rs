// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns per-cycle deltas into the series values emitted on one flush.
//!
//! Every counter carries a zero-repeat TTL. A cycle first zeroes all values
//! and decrements their TTLs, then applies the new deltas (which reset the TTL
//! to the configured repeat count). Counters whose TTL has not gone negative
//! are emitted, so an idle series reports zero for `repeat_count` more cycles
//! before it disappears.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::Hash;

use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub value: i64,
    pub zero_repeats: i32,
}

impl Counter {
    fn clean(&mut self) {
        self.value = 0;
        self.zero_repeats -= 1;
    }

    fn apply(&mut self, delta: i64, repeat_count: i32) {
        self.value += delta;
        self.zero_repeats = repeat_count;
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.zero_repeats >= 0
    }
}

/// A counter that also keeps the running total of every value it reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterWithSum {
    pub counter: Counter,
    pub sum: i64,
}

impl CounterWithSum {
    fn seeded(sum: i64) -> Self {
        CounterWithSum {
            counter: Counter::default(),
            sum,
        }
    }

    fn clean(&mut self) {
        self.sum += self.counter.value;
        self.counter.clean();
    }
}

/// Values to emit for one flush cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesBatch<K, L> {
    pub counters: Vec<(K, L, i64)>,
    pub totals: Vec<(L, i64)>,
}

impl<K, L> SeriesBatch<K, L> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.totals.is_empty()
    }
}

/// Series state owned by the flush task.
#[derive(Debug)]
pub struct SeriesState<K: Eq + Hash, L: Eq + Hash> {
    repeat_count: i32,
    seeds: BTreeMap<String, i64>,
    counters: HashMap<K, HashMap<L, Counter>>,
    totals: HashMap<L, CounterWithSum>,
}

impl<K, L> SeriesState<K, L>
where
    K: Clone + Eq + Hash,
    L: Clone + Eq + Hash + Display,
{
    #[must_use]
    pub fn new(repeat_count: u32, seeds: BTreeMap<String, i64>) -> Self {
        SeriesState {
            repeat_count: i32::try_from(repeat_count).unwrap_or(i32::MAX),
            seeds,
            counters: HashMap::new(),
            totals: HashMap::new(),
        }
    }

    /// Folds the deltas of one cycle in and returns what must be emitted.
    ///
    /// Totals report the cumulative sum per label, seeded from the configured
    /// initial value the first time the label is seen.
    pub fn cycle(&mut self, deltas: Vec<(K, HashMap<L, i64>)>) -> SeriesBatch<K, L> {
        for labels in self.counters.values_mut() {
            labels.values_mut().for_each(Counter::clean);
        }
        for total in self.totals.values_mut() {
            total.clean();
        }

        for (key, labels) in deltas {
            let per_key = self.counters.entry(key).or_default();
            for (label, delta) in labels {
                per_key
                    .entry(label.clone())
                    .or_default()
                    .apply(delta, self.repeat_count);

                let seeds = &self.seeds;
                self.totals
                    .entry(label)
                    .or_insert_with_key(|label| {
                        CounterWithSum::seeded(
                            seeds.get(&label.to_string()).copied().unwrap_or_default(),
                        )
                    })
                    .counter
                    .apply(delta, self.repeat_count);
            }
        }

        let mut counters = Vec::new();
        for (key, labels) in &self.counters {
            for (label, counter) in labels.iter().filter(|(_, c)| c.is_live()) {
                counters.push((key.clone(), label.clone(), counter.value));
            }
        }
        let totals = self
            .totals
            .iter()
            .filter(|(_, total)| total.counter.is_live())
            .map(|(label, total)| (label.clone(), total.sum + total.counter.value))
            .collect();

        SeriesBatch { counters, totals }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deltas(entries: &[(&'static str, &'static str, i64)]) -> Vec<(&'static str, HashMap<&'static str, i64>)> {
        let mut grouped: HashMap<&'static str, HashMap<&'static str, i64>> = HashMap::new();
        for (key, label, delta) in entries {
            grouped.entry(*key).or_default().insert(*label, *delta);
        }
        grouped.into_iter().collect()
    }

    #[test]
    fn test_zero_repeats_then_stops() {
        let mut state: SeriesState<&str, &str> = SeriesState::new(1, BTreeMap::new());

        let batch = state.cycle(deltas(&[("app", "ERROR", 3)]));
        assert_eq!(batch.counters, vec![("app", "ERROR", 3)]);

        let batch = state.cycle(Vec::new());
        assert_eq!(batch.counters, vec![("app", "ERROR", 0)]);

        let batch = state.cycle(Vec::new());
        assert!(batch.is_empty());
    }

    #[test]
    fn test_longer_repeat_count() {
        let mut state: SeriesState<&str, &str> = SeriesState::new(3, BTreeMap::new());
        state.cycle(deltas(&[("app", "WARN", 1)]));
        let zero_cycles = (0..10)
            .map(|_| state.cycle(Vec::new()))
            .take_while(|batch| !batch.is_empty())
            .count();
        assert_eq!(zero_cycles, 3);
    }

    #[test]
    fn test_activity_resets_ttl() {
        let mut state: SeriesState<&str, &str> = SeriesState::new(1, BTreeMap::new());
        state.cycle(deltas(&[("app", "INFO", 1)]));
        state.cycle(Vec::new());
        let batch = state.cycle(deltas(&[("app", "INFO", 2)]));
        assert_eq!(batch.counters, vec![("app", "INFO", 2)]);
        let batch = state.cycle(Vec::new());
        assert_eq!(batch.counters, vec![("app", "INFO", 0)]);
    }

    #[test]
    fn test_totals_sum_across_keys_and_cycles() {
        let mut state: SeriesState<&str, &str> = SeriesState::new(1, BTreeMap::new());
        let batch = state.cycle(deltas(&[("a", "ERROR", 2), ("b", "ERROR", 5)]));
        assert_eq!(batch.totals, vec![("ERROR", 7)]);

        let batch = state.cycle(deltas(&[("a", "ERROR", 1)]));
        assert_eq!(batch.totals, vec![("ERROR", 8)]);

        let batch = state.cycle(Vec::new());
        assert_eq!(batch.totals, vec![("ERROR", 8)]);
    }

    #[test]
    fn test_totals_start_from_seed() {
        let seeds = BTreeMap::from([("WARN".to_string(), 100)]);
        let mut state: SeriesState<&str, &str> = SeriesState::new(1, seeds);
        let batch = state.cycle(deltas(&[("a", "WARN", 1), ("a", "INFO", 1)]));
        let mut totals = batch.totals;
        totals.sort();
        assert_eq!(totals, vec![("INFO", 1), ("WARN", 101)]);
    }
}
