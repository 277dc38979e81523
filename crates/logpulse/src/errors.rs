// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error as StdError;
use std::time::Duration;

/// Boxed error raised by an [`EventAdapter`](crate::event::EventAdapter).
pub type AdapterError = Box<dyn StdError + Send + Sync>;

/// Configuration problems. These are raised at construction time and prevent
/// the aggregator from starting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid destination '{0}': {1}")]
    Destination(String, String),

    #[error("Unsupported destination scheme '{0}', expected one of tcp, udp, http, https")]
    UnsupportedScheme(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Failures of a transport writer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {0}: {1}")]
    Connect(String, #[source] std::io::Error),

    #[error("operation on {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector responded with status {0}")]
    Status(reqwest::StatusCode),

    #[error("request stream to {0} was closed by the peer")]
    Closed(String),
}

/// Failure to build a single wire line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("cannot render line with empty {0}")]
    EmptyField(&'static str),
}

/// Wrapped failure raised to the producer from `register()`.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("event adapter failed: {0}")]
    Adapter(#[source] AdapterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("aggregator already started")]
    AlreadyStarted,

    #[error("aggregator has been stopped")]
    Stopped,

    #[error("no tokio runtime to run the flush task on")]
    NoRuntime,
}
