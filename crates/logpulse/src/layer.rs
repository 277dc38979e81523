// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `tracing` integration: every event seen by the subscriber is counted and
//! possibly sampled.
//!
//! ```no_run
//! use logpulse::{Aggregator, AggregatorLayer, RecordAdapter, SenderConfig};
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SenderConfig {
//!     entity: "web-01".to_string(),
//!     destination: "udp://collector:8082".to_string(),
//!     ..Default::default()
//! };
//! let aggregator = Aggregator::new(RecordAdapter::default(), config)?;
//! let subscriber = tracing_subscriber::registry().with(AggregatorLayer::new(aggregator));
//! tracing::subscriber::set_global_default(subscriber)?;
//! # Ok(())
//! # }
//! ```

use std::fmt::Debug;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::aggregator::Aggregator;
use crate::constants::SELF_TARGET;
use crate::event::{LogRecord, RecordAdapter, Severity};

/// Fields with a special meaning; everything else becomes a context tag.
const MESSAGE_FIELD: &str = "message";
const BACKTRACE_FIELD: &str = "backtrace";
const FATAL_FIELD: &str = "fatal";

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
    backtrace: Vec<String>,
    fatal: bool,
}

impl RecordVisitor {
    fn insert(&mut self, field: &Field, value: String) {
        match field.name() {
            MESSAGE_FIELD => self.message = Some(value),
            BACKTRACE_FIELD => {
                self.backtrace = value.lines().map(|line| line.trim_end().to_string()).collect();
            }
            name if name.starts_with("log.") => {}
            name => self.fields.push((name.to_string(), value)),
        }
    }
}

impl Visit for RecordVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == FATAL_FIELD {
            self.fatal = value;
        } else {
            self.insert(field, value.to_string());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

impl From<&Event<'_>> for LogRecord {
    fn from(event: &Event<'_>) -> Self {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let mut record = LogRecord::new(
            metadata.target(),
            Severity::from(metadata.level()),
            visitor.message.unwrap_or_default(),
        )
        .with_stack_trace(visitor.backtrace);
        record.fields = visitor.fields;
        record.fatal = visitor.fatal;
        record
    }
}

fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(SELF_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// Feeds tracing events into an [`Aggregator`]. Events emitted by this crate
/// are ignored so the shipper never observes itself.
#[derive(Debug, Clone)]
pub struct AggregatorLayer {
    aggregator: Aggregator<RecordAdapter>,
}

impl AggregatorLayer {
    #[must_use]
    pub fn new(aggregator: Aggregator<RecordAdapter>) -> Self {
        AggregatorLayer { aggregator }
    }

    #[must_use]
    pub fn aggregator(&self) -> &Aggregator<RecordAdapter> {
        &self.aggregator
    }
}

impl<S: Subscriber> Layer<S> for AggregatorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if is_own_target(event.metadata().target()) {
            return;
        }
        // Failures are already reported by the aggregator; a layer cannot
        // hand them back to the caller.
        let _ = self.aggregator.register(&LogRecord::from(event));
    }
}
