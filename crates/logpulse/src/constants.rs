// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_INTERVAL_MS: u64 = 60_000;
pub const MIN_INTERVAL_FLOOR_MS: u64 = 1_000;
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 333;
pub const DEFAULT_REPEAT_COUNT: u32 = 1;

pub const DEFAULT_SKIP_THRESHOLD: usize = 100;
pub const MIN_SKIP_THRESHOLD: usize = 10;
pub const MAX_SKIP_THRESHOLD: usize = 1_000;

pub const DEFAULT_METRIC_PREFIX: &str = "log_event";
pub const DEFAULT_COUNTER_SUFFIX: &str = "_counter";
pub const DEFAULT_TOTAL_COUNTER_SUFFIX: &str = "_total_counter";

pub const DEFAULT_RESET_INTERVAL_MS: u64 = 600_000;

/// Stack depth value meaning "keep every line".
pub const UNLIMITED_STACK_LINES: i32 = -1;

/// Metadata is re-announced when older than this.
pub const PROPERTY_STALENESS: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_TCP_PORT: u16 = 8081;
pub const DEFAULT_UDP_PORT: u16 = 8082;
pub const DEFAULT_COMMAND_PATH: &str = "/api/v1/command";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Chunk size of the streamed HTTP request body.
pub const HTTP_CHUNK_SIZE: usize = 1024;
/// Largest datagram the connectionless writer emits.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

pub const SETTINGS_PROPERTY_TYPE: &str = "logger_settings";
pub const RUNTIME_PROPERTY_TYPE: &str = "logger_runtime";
pub const MESSAGE_TYPE: &str = "logger";

pub const HOSTNAME_OVERRIDE_VAR: &str = "LOGPULSE_HOSTNAME";

/// This crate's target; it and its submodules are never fed back into the
/// aggregator.
pub const SELF_TARGET: &str = "logpulse";
