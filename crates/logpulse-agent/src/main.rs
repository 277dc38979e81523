// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logpulse::{Aggregator, LogRecord, RecordAdapter, SenderConfig, Severity};

const DEFAULT_LOGGER: &str = "stdin";

/// Parses `LEVEL [logger] message`. A missing level means INFO, a missing
/// logger means `stdin`.
fn parse_line(line: &str) -> LogRecord {
    let line = line.trim_end();
    let (level, rest) = match line.split_once(char::is_whitespace) {
        Some((first, rest)) => match first.parse::<Severity>() {
            Ok(level) => (level, rest.trim_start()),
            Err(_) => (Severity::Info, line),
        },
        None => match line.parse::<Severity>() {
            Ok(level) => (level, ""),
            Err(_) => (Severity::Info, line),
        },
    };

    let (logger, message) = rest
        .strip_prefix('[')
        .and_then(|tail| tail.split_once(']'))
        .filter(|(logger, _)| !logger.trim().is_empty())
        .map_or((DEFAULT_LOGGER, rest), |(logger, message)| {
            (logger.trim(), message.trim_start())
        });

    LogRecord::new(logger, level, message)
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOGPULSE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }
    debug!("Logging subsystem enabled");

    let config = match SenderConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let min_severity = env::var("LOGPULSE_MIN_SEVERITY")
        .ok()
        .and_then(|val| val.parse::<Severity>().ok())
        .unwrap_or(Severity::Info);

    info!(
        "Shipping log events from stdin to {} as {}",
        config.destination, config.entity
    );
    let aggregator = match Aggregator::new(RecordAdapter::new(min_severity), config) {
        Ok(aggregator) => aggregator,
        Err(e) => {
            error!("Failed to create aggregator: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    if let Err(e) = aggregator.start(&shutdown) {
        error!("Failed to start aggregator: {}", e);
        return ExitCode::FAILURE;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = aggregator.register(&parse_line(&line)) {
                        debug!("Skipping line: {}", e);
                    }
                }
                Ok(None) => {
                    debug!("End of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    aggregator.stop().await;
    info!("Shipped {} log events", aggregator.total_events());
    ExitCode::SUCCESS
}
