// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded drop-oldest queue of samples awaiting the flush task.
//!
//! Producers never block and never fail: once the live count exceeds the skip
//! threshold the oldest entry is evicted, so under overload the freshest
//! samples survive.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use tracing::debug;

use crate::event::Sample;

#[derive(Debug)]
pub struct SampleQueue {
    items: SegQueue<Sample>,
    // Incremented before the push and decremented after a pop, so it never
    // undercounts the queue.
    len: AtomicUsize,
    threshold: usize,
    dropped: AtomicU64,
}

impl SampleQueue {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        SampleQueue {
            items: SegQueue::new(),
            len: AtomicUsize::new(0),
            threshold,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, sample: Sample) {
        let len = self.len.fetch_add(1, Ordering::AcqRel) + 1;
        self.items.push(sample);
        if len > self.threshold && self.items.pop().is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Sample queue above {} items, dropped oldest sample",
                self.threshold
            );
        }
    }

    /// Removes everything currently queued, oldest first.
    pub fn drain_all(&self) -> Vec<Sample> {
        let mut drained = Vec::with_capacity(self.items.len());
        while let Some(sample) = self.items.pop() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            drained.push(sample);
        }
        drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Number of evictions since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use std::sync::Arc;
    use std::thread;

    fn sample(n: usize) -> Sample {
        Sample {
            key: "app".to_string(),
            label: "ERROR".to_string(),
            severity: Severity::Error,
            message: format!("message {n}"),
            stack_trace: Vec::new(),
            context: Vec::new(),
            max_stack_lines: 0,
        }
    }

    #[test]
    fn test_drain_is_fifo() {
        let queue = SampleQueue::new(10);
        for n in 0..3 {
            queue.push(sample(n));
        }
        let drained = queue.drain_all();
        let messages: Vec<_> = drained.iter().map(|s| s.message.as_str()).collect();
        assert_eq!(messages, vec!["message 0", "message 1", "message 2"]);
        assert!(queue.is_empty());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_keeps_most_recent_when_over_threshold() {
        let queue = SampleQueue::new(10);
        for n in 0..25 {
            queue.push(sample(n));
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.take_dropped(), 15);
        assert_eq!(queue.take_dropped(), 0);

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 10);
        assert_eq!(drained[0].message, "message 15");
        assert_eq!(drained[9].message, "message 24");
    }

    #[test]
    fn test_concurrent_producers_stay_bounded() {
        let queue = Arc::new(SampleQueue::new(50));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for n in 0..500 {
                        queue.push(sample(n));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(queue.len(), 50);
        assert_eq!(queue.drain_all().len(), 50);
        assert_eq!(queue.take_dropped(), 1_950);
    }
}
