// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The orchestrator tying counting, sampling and shipping together.
//!
//! Producers call [`Aggregator::register`] from any thread; it only touches
//! atomics, sharded maps and a lock-free queue. One background task, spawned
//! by [`Aggregator::start`], wakes every check interval, decides whether a
//! series flush is due, drains the sample queue and writes everything through
//! the transport. Shutdown is driven by a [`CancellationToken`]: cancelling the
//! embedder's token or calling [`Aggregator::stop`] both run the final flush,
//! exactly once.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;
use hashbrown::HashMap;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch, Instrument};

use crate::config::SenderConfig;
use crate::constants::UNLIMITED_STACK_LINES;
use crate::counting::EventCounter;
use crate::errors::{ConfigError, RegisterError, StartError};
use crate::event::{EventAdapter, Sample};
use crate::queue::SampleQueue;
use crate::render::{MessageRenderer, ProcessMetadata};
use crate::series::SeriesState;
use crate::transport::{build_transport, Transport};
use crate::trigger::TriggerSet;

/// Everything only the flush side touches.
struct FlushState<K: Eq + Hash, L: Eq + Hash> {
    transport: Box<dyn Transport>,
    renderer: MessageRenderer,
    snapshots: HashMap<K, HashMap<L, i64>>,
    series: SeriesState<K, L>,
    last_flush: Instant,
}

enum Lifecycle {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

struct Inner<A: EventAdapter> {
    adapter: A,
    config: SenderConfig,
    counter: EventCounter<A::Key, A::Label>,
    triggers: TriggerSet<A::Key>,
    queue: SampleQueue,
    // Fatal samples, never evicted.
    urgent: SegQueue<Sample>,
    wakeup: Notify,
    total_events: AtomicU64,
    events_since_flush: AtomicU64,
    flush: TokioMutex<FlushState<A::Key, A::Label>>,
    lifecycle: Mutex<Lifecycle>,
    final_flushed: AtomicBool,
    dispatch: Option<Dispatch>,
}

/// Counts and samples events of one adapter and ships them to one collector.
///
/// Cheap to clone; all clones share the same engine.
pub struct Aggregator<A: EventAdapter> {
    inner: Arc<Inner<A>>,
}

impl<A: EventAdapter> Clone for Aggregator<A> {
    fn clone(&self) -> Self {
        Aggregator {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: EventAdapter> fmt::Debug for Aggregator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("entity", &self.inner.config.entity)
            .field("destination", &self.inner.config.destination)
            .field("total_events", &self.total_events())
            .field("queued_samples", &self.queued_samples())
            .finish_non_exhaustive()
    }
}

pub struct AggregatorBuilder<A: EventAdapter> {
    adapter: A,
    config: SenderConfig,
    transport: Option<Box<dyn Transport>>,
    metadata: Option<ProcessMetadata>,
    dispatch: Option<Dispatch>,
}

impl<A: EventAdapter> AggregatorBuilder<A> {
    #[must_use]
    pub fn new(adapter: A, config: SenderConfig) -> Self {
        AggregatorBuilder {
            adapter,
            config,
            transport: None,
            metadata: None,
            dispatch: None,
        }
    }

    /// Uses `transport` instead of the one selected by the destination.
    #[must_use]
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: ProcessMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Routes the aggregator's own diagnostics to `dispatch`.
    #[must_use]
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn build(self) -> Result<Aggregator<A>, ConfigError> {
        let config = self.config;
        config.validate()?;

        let metadata = self.metadata.unwrap_or_else(ProcessMetadata::detect);
        let renderer = MessageRenderer::new(&config, &metadata)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => build_transport(&config)?,
        };

        let inner = Inner {
            counter: EventCounter::new(),
            triggers: TriggerSet::new(&config.effective_triggers()),
            queue: SampleQueue::new(config.effective_skip_threshold()),
            urgent: SegQueue::new(),
            wakeup: Notify::new(),
            total_events: AtomicU64::new(0),
            events_since_flush: AtomicU64::new(0),
            flush: TokioMutex::new(FlushState {
                transport,
                renderer,
                snapshots: HashMap::new(),
                series: SeriesState::new(config.repeat_count, config.total_counter_seeds.clone()),
                last_flush: Instant::now(),
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
            final_flushed: AtomicBool::new(false),
            dispatch: self.dispatch,
            adapter: self.adapter,
            config,
        };
        Ok(Aggregator {
            inner: Arc::new(inner),
        })
    }
}

impl<A: EventAdapter> Aggregator<A> {
    /// Builds an aggregator writing to the configured destination.
    pub fn new(adapter: A, config: SenderConfig) -> Result<Self, ConfigError> {
        AggregatorBuilder::new(adapter, config).build()
    }

    #[must_use]
    pub fn builder(adapter: A, config: SenderConfig) -> AggregatorBuilder<A> {
        AggregatorBuilder::new(adapter, config)
    }

    /// Counts `event` and, when a trigger fires, queues it for verbatim
    /// forwarding. Never blocks and never performs I/O.
    pub fn register(&self, event: &A::Event) -> Result<(), RegisterError> {
        let inner = &self.inner;
        let adapter = &inner.adapter;
        let key = adapter.key(event);
        inner.counter.increment(key.clone(), adapter.label(event));
        inner.total_events.fetch_add(1, Ordering::Relaxed);
        inner.events_since_flush.fetch_add(1, Ordering::Relaxed);

        if !inner.config.send_samples || !adapter.is_enabled(event) {
            return Ok(());
        }

        if adapter.is_fatal(event) {
            let sample = capture(adapter, event, UNLIMITED_STACK_LINES)?;
            inner.urgent.push(sample);
            inner.wakeup.notify_one();
            return Ok(());
        }

        if let Some(depth) = inner
            .triggers
            .evaluate(&key, adapter.severity(event), Instant::now())
        {
            inner.queue.push(capture(adapter, event, depth)?);
        }
        Ok(())
    }

    /// Spawns the flush task on the current runtime. The task stops when
    /// `shutdown` (or [`Aggregator::stop`]) is cancelled, after a final flush.
    pub fn start(&self, shutdown: &CancellationToken) -> Result<(), StartError> {
        let runtime = Handle::try_current().map_err(|_| StartError::NoRuntime)?;
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match *lifecycle {
            Lifecycle::Running { .. } => return Err(StartError::AlreadyStarted),
            Lifecycle::Stopped => return Err(StartError::Stopped),
            Lifecycle::Idle => {}
        }

        let cancel = shutdown.child_token();
        let run = run(Arc::clone(&self.inner), cancel.clone()).in_current_span();
        let handle = match &self.inner.dispatch {
            Some(dispatch) => runtime.spawn(run.with_subscriber(dispatch.clone())),
            None => runtime.spawn(run),
        };
        *lifecycle = Lifecycle::Running { cancel, handle };
        Ok(())
    }

    /// Runs the final flush and closes the transport. Safe to call any number
    /// of times, from any task, whether or not the aggregator was started.
    pub async fn stop(&self) {
        let previous = {
            let mut lifecycle = self
                .inner
                .lifecycle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        match previous {
            Lifecycle::Running { cancel, handle } => {
                cancel.cancel();
                if let Err(e) = handle.await {
                    error!("Flush task ended abnormally: {}", e);
                }
                // The task may have been aborted before its own final flush.
                self.final_flush().await;
            }
            Lifecycle::Idle => self.final_flush().await,
            Lifecycle::Stopped => debug!("Aggregator already stopped"),
        }
    }

    async fn final_flush(&self) {
        let inner = Arc::clone(&self.inner);
        match &self.inner.dispatch {
            Some(dispatch) => final_flush(inner).with_subscriber(dispatch.clone()).await,
            None => final_flush(inner).await,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .lifecycle
            .lock()
            .map(|lifecycle| matches!(*lifecycle, Lifecycle::Running { .. }))
            .unwrap_or(false)
    }

    /// Samples waiting for the next flush tick.
    #[must_use]
    pub fn queued_samples(&self) -> usize {
        self.inner.queue.len() + self.inner.urgent.len()
    }

    /// Events registered since construction.
    #[must_use]
    pub fn total_events(&self) -> u64 {
        self.inner.total_events.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }
}

fn capture<A: EventAdapter>(
    adapter: &A,
    event: &A::Event,
    max_stack_lines: i32,
) -> Result<Sample, RegisterError> {
    Sample::capture(adapter, event, max_stack_lines).map_err(|e| {
        warn!("Failed to capture log event sample: {}", e);
        RegisterError::Adapter(e)
    })
}

async fn run<A: EventAdapter>(inner: Arc<Inner<A>>, cancel: CancellationToken) {
    debug!(
        "Starting flush task, checking every {:?}",
        inner.config.check_interval()
    );
    let mut ticker = interval(inner.config.check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("Shutting down log event aggregator");
                break;
            }
            () = inner.wakeup.notified() => {
                let mut state = inner.flush.lock().await;
                let lines = collect_samples(&inner, &state.renderer);
                send(&mut state, lines).await;
            }
            _ = ticker.tick() => {
                let mut state = inner.flush.lock().await;
                tick(&inner, &mut state, Instant::now(), false).await;
            }
        }
    }

    final_flush(inner).await;
}

async fn final_flush<A: EventAdapter>(inner: Arc<Inner<A>>) {
    if inner.final_flushed.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!("Running final flush");
    let mut state = inner.flush.lock().await;
    tick(&inner, &mut state, Instant::now(), true).await;
    if let Err(e) = state.transport.close().await {
        warn!("Failed to close collector transport: {}", e);
    }
}

/// One pass of the flush loop. `force` emits series regardless of timing.
async fn tick<A: EventAdapter>(
    inner: &Inner<A>,
    state: &mut FlushState<A::Key, A::Label>,
    now: Instant,
    force: bool,
) {
    let mut lines = state.renderer.announce_if_stale(now).unwrap_or_default();

    let config = &inner.config;
    let dt = now.saturating_duration_since(state.last_flush);
    let time_due = dt > config.interval();
    let burst_due = config.min_interval_threshold > 0
        && dt > config.min_interval()
        && inner.events_since_flush.load(Ordering::Relaxed) > config.min_interval_threshold;

    if force || time_due || burst_due {
        if burst_due && !time_due {
            debug!("Event burst, flushing series early");
        }
        inner.events_since_flush.store(0, Ordering::Relaxed);
        state.last_flush = now;
        let deltas = inner.counter.diff_all(&mut state.snapshots);
        let batch = state.series.cycle(deltas);
        for (key, label, value) in &batch.counters {
            match state
                .renderer
                .counter_line(&key.to_string(), &label.to_string(), *value)
            {
                Ok(line) => lines.push(line),
                Err(e) => warn!("Skipping counter line for {}: {}", key, e),
            }
        }
        for (label, value) in &batch.totals {
            match state.renderer.total_line(&label.to_string(), *value) {
                Ok(line) => lines.push(line),
                Err(e) => warn!("Skipping total line for {}: {}", label, e),
            }
        }
    }

    lines.extend(collect_samples(inner, &state.renderer));
    send(state, lines).await;
}

fn collect_samples<A: EventAdapter>(inner: &Inner<A>, renderer: &MessageRenderer) -> Vec<String> {
    let mut samples = Vec::new();
    while let Some(sample) = inner.urgent.pop() {
        samples.push(sample);
    }
    samples.extend(inner.queue.drain_all());

    let dropped = inner.queue.take_dropped();
    if dropped > 0 {
        warn!(
            "Dropped {} samples, more than {} were waiting",
            dropped,
            inner.queue.threshold()
        );
    }

    samples
        .iter()
        .filter_map(|sample| match renderer.message_line(sample) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!("Skipping sample from {}: {}", sample.key, e);
                None
            }
        })
        .collect()
}

async fn send<K: Eq + Hash, L: Eq + Hash>(
    state: &mut FlushState<K, L>,
    lines: Vec<String>,
) {
    if lines.is_empty() {
        return;
    }
    let mut payload = lines.join("\n");
    payload.push('\n');
    match state.transport.write(payload.as_bytes()).await {
        Ok(written) => debug!("Sent {} lines ({} bytes) to collector", lines.len(), written),
        Err(e) => error!("Failed to send {} lines to collector: {}", lines.len(), e),
    }
}
