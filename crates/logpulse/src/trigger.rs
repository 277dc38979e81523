// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential-backoff gates deciding which events are forwarded verbatim.
//!
//! Within one reset window a trigger fires on event 1 and then whenever the
//! per-key event count reaches the next threshold, which is multiplied by the
//! send multiplier after each firing. With multiplier 2 a key fires on events
//! 1, 2, 4, 8, ...

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use fnv::FnvBuildHasher;
use tokio::time::Instant;

use crate::config::TriggerConfig;
use crate::constants::UNLIMITED_STACK_LINES;
use crate::event::Severity;

/// Combines two stack depth requests. Unlimited wins over any finite depth.
#[must_use]
pub fn merge_stack_lines(a: i32, b: i32) -> i32 {
    if a == UNLIMITED_STACK_LINES || b == UNLIMITED_STACK_LINES {
        UNLIMITED_STACK_LINES
    } else {
        a.max(b)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerHistory {
    pub event_count: i64,
    pub window_start: Instant,
    pub next_threshold: f64,
}

impl TriggerHistory {
    fn new(now: Instant) -> Self {
        TriggerHistory {
            event_count: 0,
            window_start: now,
            next_threshold: 1.0,
        }
    }

    fn reset(&mut self, now: Instant) {
        *self = TriggerHistory::new(now);
    }
}

#[derive(Debug)]
pub struct SendTrigger<K: Eq + Hash> {
    severity: Severity,
    send_multiplier: f64,
    reset_interval: Duration,
    max_stack_lines: i32,
    history: DashMap<K, TriggerHistory, FnvBuildHasher>,
}

impl<K: Eq + Hash + Clone> SendTrigger<K> {
    #[must_use]
    pub fn new(config: &TriggerConfig) -> Self {
        SendTrigger {
            severity: config.severity,
            send_multiplier: config.effective_multiplier(),
            reset_interval: Duration::from_millis(config.reset_interval_ms),
            max_stack_lines: config.effective_stack_lines(),
            history: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    #[must_use]
    pub fn applies_to(&self, severity: Severity) -> bool {
        self.severity == severity
    }

    #[must_use]
    pub fn max_stack_lines(&self) -> i32 {
        self.max_stack_lines
    }

    #[must_use]
    pub fn send_multiplier(&self) -> f64 {
        self.send_multiplier
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Counts one event for `key` and reports whether it should be forwarded.
    ///
    /// The whole read-compare-update runs under the map entry's lock, so
    /// concurrent events for the same key never lose a threshold update.
    pub fn should_forward(&self, key: &K, now: Instant) -> bool {
        match self.history.get_mut(key) {
            Some(mut history) => self.advance(&mut history, now),
            None => {
                let mut history = self
                    .history
                    .entry(key.clone())
                    .or_insert_with(|| TriggerHistory::new(now));
                self.advance(&mut history, now)
            }
        }
    }

    fn advance(&self, history: &mut TriggerHistory, now: Instant) -> bool {
        if now.saturating_duration_since(history.window_start) > self.reset_interval {
            history.reset(now);
        }
        history.event_count += 1;
        #[allow(clippy::cast_precision_loss)]
        let fire = history.event_count as f64 >= history.next_threshold;
        if fire && self.send_multiplier > 1.0 {
            history.next_threshold *= self.send_multiplier;
        }
        fire
    }

    #[cfg(test)]
    pub(crate) fn history(&self, key: &K) -> Option<TriggerHistory> {
        self.history.get(key).map(|history| history.clone())
    }
}

/// All triggers of one aggregator.
#[derive(Debug)]
pub struct TriggerSet<K: Eq + Hash> {
    triggers: Vec<SendTrigger<K>>,
}

impl<K: Eq + Hash + Clone> TriggerSet<K> {
    #[must_use]
    pub fn new(configs: &[TriggerConfig]) -> Self {
        TriggerSet {
            triggers: configs.iter().map(SendTrigger::new).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendTrigger<K>> {
        self.triggers.iter()
    }

    /// Evaluates every trigger for the event's severity. Returns the stack depth
    /// to capture when at least one of them fires.
    pub fn evaluate(&self, key: &K, severity: Severity, now: Instant) -> Option<i32> {
        let mut requested: Option<i32> = None;
        for trigger in self.triggers.iter().filter(|t| t.applies_to(severity)) {
            if trigger.should_forward(key, now) {
                let depth = trigger.max_stack_lines();
                requested = Some(requested.map_or(depth, |current| merge_stack_lines(current, depth)));
            }
        }
        requested
    }
}
