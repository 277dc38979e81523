// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process log event shipper.
//!
//! Log events are counted per routing key and label, a geometrically thinned
//! sample of them is kept verbatim, and both are periodically written to a
//! collector speaking a small text line protocol over TCP, UDP or streaming
//! HTTP(S).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod canonical;
pub mod config;
pub mod constants;
pub mod counting;
pub mod errors;
pub mod event;
pub mod layer;
pub mod queue;
pub mod render;
pub mod series;
pub mod transport;
pub mod trigger;

pub use aggregator::{Aggregator, AggregatorBuilder};
pub use config::{SenderConfig, TriggerConfig};
pub use errors::{ConfigError, RegisterError, RenderError, StartError, TransportError};
pub use event::{EventAdapter, LogRecord, RecordAdapter, Sample, Severity};
pub use layer::AggregatorLayer;
pub use render::{MessageRenderer, ProcessMetadata};
pub use transport::{build_transport, Destination, Transport};
