// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The boundary between a logging framework and the aggregator.
//!
//! A framework integration implements [`EventAdapter`] for its native event
//! type: it extracts the routing key and label used for counting, renders the
//! display message, and classifies severity. [`LogRecord`] together with
//! [`RecordAdapter`] is a ready-made owned event type used by the tracing
//! layer and the stdin agent.

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use derive_more::Display;
use serde::Deserialize;

use crate::constants::UNLIMITED_STACK_LINES;
use crate::errors::AdapterError;

/// Severity classes known to the sampling triggers.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[display("TRACE")]
    Trace,
    #[display("DEBUG")]
    Debug,
    #[display("INFO")]
    Info,
    #[display("WARN")]
    Warn,
    #[display("ERROR")]
    Error,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" | "FINEST" | "FINER" => Ok(Severity::Trace),
            "DEBUG" | "FINE" => Ok(Severity::Debug),
            "INFO" | "CONFIG" => Ok(Severity::Info),
            "WARN" | "WARNING" => Ok(Severity::Warn),
            "ERROR" | "SEVERE" | "FATAL" | "CRITICAL" => Ok(Severity::Error),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

impl From<&tracing::Level> for Severity {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Severity::Trace,
            tracing::Level::DEBUG => Severity::Debug,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::WARN => Severity::Warn,
            tracing::Level::ERROR => Severity::Error,
        }
    }
}

/// Capability interface implemented once per logging framework.
pub trait EventAdapter: Send + Sync + 'static {
    type Event: ?Sized;
    /// Counting granularity, e.g. the logger name.
    type Key: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;
    /// Sub-classification inside a key, e.g. the level.
    type Label: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;

    fn key(&self, event: &Self::Event) -> Self::Key;

    fn label(&self, event: &Self::Event) -> Self::Label;

    fn severity(&self, event: &Self::Event) -> Severity;

    /// Renders the display message, honoring any framework formatting pattern.
    fn render(&self, event: &Self::Event) -> Result<String, AdapterError>;

    /// Whether the event meets the minimum severity for sampling.
    fn is_enabled(&self, _event: &Self::Event) -> bool {
        true
    }

    /// Unrecoverable low-level faults skip the triggers and are forwarded at once.
    fn is_fatal(&self, _event: &Self::Event) -> bool {
        false
    }

    fn stack_trace(&self, _event: &Self::Event) -> Vec<String> {
        Vec::new()
    }

    /// Contextual key/value pairs rendered as extra message tags.
    fn context(&self, _event: &Self::Event) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// A verbatim event captured for forwarding. Built once on the producer thread,
/// rendered once by the flush task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub key: String,
    pub label: String,
    pub severity: Severity,
    pub message: String,
    pub stack_trace: Vec<String>,
    pub context: Vec<(String, String)>,
    pub max_stack_lines: i32,
}

impl Sample {
    pub fn capture<A: EventAdapter>(
        adapter: &A,
        event: &A::Event,
        max_stack_lines: i32,
    ) -> Result<Self, AdapterError> {
        let message = adapter.render(event)?;
        let stack_trace = if max_stack_lines == 0 {
            Vec::new()
        } else {
            let mut lines = adapter.stack_trace(event);
            if max_stack_lines != UNLIMITED_STACK_LINES {
                lines.truncate(usize::try_from(max_stack_lines).unwrap_or(0));
            }
            lines
        };
        Ok(Sample {
            key: adapter.key(event).to_string(),
            label: adapter.label(event).to_string(),
            severity: adapter.severity(event),
            message,
            stack_trace,
            context: adapter.context(event),
            max_stack_lines,
        })
    }
}

/// Owned log event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub target: String,
    pub level: Severity,
    pub message: String,
    pub fields: Vec<(String, String)>,
    pub stack_trace: Vec<String>,
    pub fatal: bool,
}

impl LogRecord {
    pub fn new(target: impl Into<String>, level: Severity, message: impl Into<String>) -> Self {
        LogRecord {
            target: target.into(),
            level,
            message: message.into(),
            fields: Vec::new(),
            stack_trace: Vec::new(),
            fatal: false,
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_stack_trace(mut self, lines: Vec<String>) -> Self {
        self.stack_trace = lines;
        self
    }

    #[must_use]
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// [`EventAdapter`] for [`LogRecord`]: keyed by target, labelled by level.
#[derive(Clone, Debug)]
pub struct RecordAdapter {
    min_severity: Severity,
}

impl RecordAdapter {
    #[must_use]
    pub fn new(min_severity: Severity) -> Self {
        RecordAdapter { min_severity }
    }
}

impl Default for RecordAdapter {
    fn default() -> Self {
        RecordAdapter::new(Severity::Info)
    }
}

impl EventAdapter for RecordAdapter {
    type Event = LogRecord;
    type Key = String;
    type Label = Severity;

    fn key(&self, event: &LogRecord) -> String {
        event.target.clone()
    }

    fn label(&self, event: &LogRecord) -> Severity {
        event.level
    }

    fn severity(&self, event: &LogRecord) -> Severity {
        event.level
    }

    fn render(&self, event: &LogRecord) -> Result<String, AdapterError> {
        Ok(event.message.clone())
    }

    fn is_enabled(&self, event: &LogRecord) -> bool {
        event.level >= self.min_severity
    }

    fn is_fatal(&self, event: &LogRecord) -> bool {
        event.fatal && event.level == Severity::Error
    }

    fn stack_trace(&self, event: &LogRecord) -> Vec<String> {
        event.stack_trace.clone()
    }

    fn context(&self, event: &LogRecord) -> Vec<(String, String)> {
        event.fields.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record_with_stack() -> LogRecord {
        LogRecord::new("app::db", Severity::Error, "query failed").with_stack_trace(vec![
            "at db::query".to_string(),
            "at app::handler".to_string(),
            "at main".to_string(),
        ])
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warn);
        assert_eq!("FATAL".parse::<Severity>().unwrap(), Severity::Error);
        assert_eq!(" info ".parse::<Severity>().unwrap(), Severity::Info);
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn test_severity_display_and_order() {
        assert_eq!(Severity::Warn.to_string(), "WARN");
        assert!(Severity::Error > Severity::Warn);
        assert!(Severity::Debug < Severity::Info);
    }

    #[test]
    fn test_capture_truncates_stack() {
        let adapter = RecordAdapter::default();
        let sample = Sample::capture(&adapter, &record_with_stack(), 2).unwrap();
        assert_eq!(sample.stack_trace.len(), 2);
        assert_eq!(sample.key, "app::db");
        assert_eq!(sample.label, "ERROR");
        assert_eq!(sample.message, "query failed");
    }

    #[test]
    fn test_capture_unlimited_and_none() {
        let adapter = RecordAdapter::default();
        let all = Sample::capture(&adapter, &record_with_stack(), UNLIMITED_STACK_LINES).unwrap();
        assert_eq!(all.stack_trace.len(), 3);
        let none = Sample::capture(&adapter, &record_with_stack(), 0).unwrap();
        assert!(none.stack_trace.is_empty());
    }

    #[test]
    fn test_record_adapter_threshold() {
        let adapter = RecordAdapter::new(Severity::Warn);
        assert!(adapter.is_enabled(&LogRecord::new("a", Severity::Error, "x")));
        assert!(adapter.is_enabled(&LogRecord::new("a", Severity::Warn, "x")));
        assert!(!adapter.is_enabled(&LogRecord::new("a", Severity::Info, "x")));
    }

    #[test]
    fn test_fatal_requires_error_level() {
        let adapter = RecordAdapter::default();
        assert!(adapter.is_fatal(&LogRecord::new("a", Severity::Error, "x").fatal()));
        assert!(!adapter.is_fatal(&LogRecord::new("a", Severity::Warn, "x").fatal()));
    }
}
