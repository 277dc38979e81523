// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_CHECK_INTERVAL_MS, DEFAULT_COUNTER_SUFFIX, DEFAULT_INTERVAL_MS, DEFAULT_METRIC_PREFIX,
    DEFAULT_MIN_INTERVAL_MS, DEFAULT_REPEAT_COUNT, DEFAULT_RESET_INTERVAL_MS,
    DEFAULT_SKIP_THRESHOLD, DEFAULT_TOTAL_COUNTER_SUFFIX, MAX_SKIP_THRESHOLD,
    MIN_INTERVAL_FLOOR_MS, MIN_SKIP_THRESHOLD, UNLIMITED_STACK_LINES,
};
use crate::errors::ConfigError;
use crate::event::Severity;
use crate::render::detect_hostname;
use crate::transport::Destination;

/// One sampling trigger. Unset fields take the severity's defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TriggerConfig {
    pub severity: Severity,
    #[serde(default)]
    pub send_multiplier: Option<f64>,
    #[serde(default = "default_reset_interval_ms")]
    pub reset_interval_ms: u64,
    #[serde(default)]
    pub stack_trace_lines: Option<i32>,
}

fn default_reset_interval_ms() -> u64 {
    DEFAULT_RESET_INTERVAL_MS
}

impl TriggerConfig {
    /// The built-in trigger for a severity class.
    #[must_use]
    pub fn for_severity(severity: Severity) -> Self {
        TriggerConfig {
            severity,
            send_multiplier: None,
            reset_interval_ms: DEFAULT_RESET_INTERVAL_MS,
            stack_trace_lines: None,
        }
    }

    #[must_use]
    pub fn effective_multiplier(&self) -> f64 {
        self.send_multiplier.unwrap_or(match self.severity {
            Severity::Error => 2.0,
            Severity::Warn => 3.0,
            Severity::Info => 5.0,
            Severity::Debug | Severity::Trace => 1.0,
        })
    }

    #[must_use]
    pub fn effective_stack_lines(&self) -> i32 {
        self.stack_trace_lines.unwrap_or(match self.severity {
            Severity::Error => UNLIMITED_STACK_LINES,
            _ => 0,
        })
    }
}

/// Tuning of the aggregator. Immutable once the aggregator is built.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Entity the series and messages are reported under, typically the host.
    pub entity: String,
    pub tags: BTreeMap<String, String>,
    /// Collector URI; the scheme selects the transport.
    pub destination: String,
    pub interval_ms: u64,
    pub min_interval_ms: u64,
    /// Events since the last flush that trigger an early flush; 0 disables it.
    pub min_interval_threshold: u64,
    pub repeat_count: u32,
    pub metric_prefix: String,
    pub counter_suffix: String,
    pub total_counter_suffix: String,
    pub message_skip_threshold: usize,
    pub check_interval_ms: u64,
    /// Initial value of the total counter per label.
    pub total_counter_seeds: BTreeMap<String, i64>,
    pub ignore_ssl_errors: bool,
    pub send_samples: bool,
    /// Empty means the ERROR, WARN and INFO defaults.
    pub triggers: Vec<TriggerConfig>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            entity: String::new(),
            tags: BTreeMap::new(),
            destination: "tcp://localhost".to_string(),
            interval_ms: DEFAULT_INTERVAL_MS,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            min_interval_threshold: 0,
            repeat_count: DEFAULT_REPEAT_COUNT,
            metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
            counter_suffix: DEFAULT_COUNTER_SUFFIX.to_string(),
            total_counter_suffix: DEFAULT_TOTAL_COUNTER_SUFFIX.to_string(),
            message_skip_threshold: DEFAULT_SKIP_THRESHOLD,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            total_counter_seeds: BTreeMap::new(),
            ignore_ssl_errors: false,
            send_samples: true,
            triggers: Vec::new(),
        }
    }
}

impl SenderConfig {
    /// Create configuration from `LOGPULSE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let entity = env::var("LOGPULSE_ENTITY")
            .ok()
            .filter(|entity| !entity.trim().is_empty())
            .unwrap_or_else(detect_hostname);
        let tags = env::var("LOGPULSE_TAGS")
            .map(|val| parse_tag_list(&val))
            .unwrap_or_default();
        let destination = env::var("LOGPULSE_DESTINATION").unwrap_or(defaults.destination);
        let ignore_ssl_errors = env::var("LOGPULSE_IGNORE_SSL_ERRORS")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(false);
        let metric_prefix = env::var("LOGPULSE_METRIC_PREFIX").unwrap_or(defaults.metric_prefix);

        let config = Self {
            entity,
            tags,
            destination,
            interval_ms: env_number("LOGPULSE_INTERVAL_MS", defaults.interval_ms),
            min_interval_ms: env_number("LOGPULSE_MIN_INTERVAL_MS", defaults.min_interval_ms),
            min_interval_threshold: env_number(
                "LOGPULSE_MIN_INTERVAL_THRESHOLD",
                defaults.min_interval_threshold,
            ),
            repeat_count: env_number("LOGPULSE_REPEAT_COUNT", defaults.repeat_count),
            metric_prefix,
            message_skip_threshold: env_number(
                "LOGPULSE_SKIP_THRESHOLD",
                defaults.message_skip_threshold,
            ),
            check_interval_ms: env_number("LOGPULSE_CHECK_INTERVAL_MS", defaults.check_interval_ms),
            ignore_ssl_errors,
            ..Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entity.trim().is_empty() {
            return Err(ConfigError::Invalid("entity cannot be empty".to_string()));
        }
        if self.interval_ms < MIN_INTERVAL_FLOOR_MS {
            return Err(ConfigError::Invalid(format!(
                "interval must be at least {MIN_INTERVAL_FLOOR_MS} ms, got {}",
                self.interval_ms
            )));
        }
        if self.min_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "minimum interval must be greater than 0".to_string(),
            ));
        }
        if self.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "check interval must be greater than 0".to_string(),
            ));
        }
        if self.metric_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "metric prefix cannot be empty".to_string(),
            ));
        }
        for trigger in &self.triggers {
            let multiplier = trigger.effective_multiplier();
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "send multiplier for {} must be at least 1, got {multiplier}",
                    trigger.severity
                )));
            }
            if trigger.effective_stack_lines() < UNLIMITED_STACK_LINES {
                return Err(ConfigError::Invalid(format!(
                    "stack trace lines for {} must be -1 or more",
                    trigger.severity
                )));
            }
        }
        Destination::parse(&self.destination)?;
        Ok(())
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub fn effective_skip_threshold(&self) -> usize {
        self.message_skip_threshold
            .clamp(MIN_SKIP_THRESHOLD, MAX_SKIP_THRESHOLD)
    }

    #[must_use]
    pub fn counter_metric(&self) -> String {
        format!("{}{}", self.metric_prefix, self.counter_suffix)
    }

    #[must_use]
    pub fn total_counter_metric(&self) -> String {
        format!("{}{}", self.metric_prefix, self.total_counter_suffix)
    }

    #[must_use]
    pub fn effective_triggers(&self) -> Vec<TriggerConfig> {
        if self.triggers.is_empty() {
            [Severity::Error, Severity::Warn, Severity::Info]
                .into_iter()
                .map(TriggerConfig::for_severity)
                .collect()
        } else {
            self.triggers.clone()
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parses `k=v,k2=v2`. Pairs without `=` are ignored.
#[must_use]
pub fn parse_tag_list(list: &str) -> BTreeMap<String, String> {
    list.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}
