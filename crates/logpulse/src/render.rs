// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Builds the line protocol understood by the collector.
//!
//! ```text
//! property e:<entity> t:<type> k:command=<cmd> v:<name>=<value> ...
//! series e:<entity> t:<tag>=<value>... m:<metric>=<count> t:level=<label> t:logger=<key>
//! message e:<entity> t:<tag>=<value>... t:type=logger m:<text> t:severity=<S> t:level=<label> t:source=<key>
//! ```

use std::env;
use std::fmt::Write;

use tokio::time::Instant;
use tracing::warn;

use crate::canonical::{escape_value, fold_newlines, merge_tags, sanitize_name, write_tag};
use crate::config::SenderConfig;
use crate::constants::{
    HOSTNAME_OVERRIDE_VAR, MESSAGE_TYPE, PROPERTY_STALENESS, RUNTIME_PROPERTY_TYPE,
    SETTINGS_PROPERTY_TYPE,
};
use crate::errors::RenderError;
use crate::event::Sample;

/// Facts about the running process, announced in the runtime property line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMetadata {
    pub command: String,
    pub pid: u32,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
}

impl ProcessMetadata {
    #[must_use]
    pub fn detect() -> Self {
        let command = env::args()
            .next()
            .and_then(|arg0| {
                std::path::Path::new(&arg0)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "unknown".to_string());
        ProcessMetadata {
            command,
            pid: std::process::id(),
            hostname: detect_hostname(),
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Hostname from `LOGPULSE_HOSTNAME`, then `HOSTNAME`, then the system call,
/// falling back to "unknown".
pub(crate) fn detect_hostname() -> String {
    for var in [HOSTNAME_OVERRIDE_VAR, "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    if let Some(hostname) = system_hostname() {
        return hostname;
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname
            .to_str()
            .filter(|hostname| !hostname.is_empty())
            .map(str::to_string),
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    None
}

#[derive(Debug)]
pub struct MessageRenderer {
    series_prefix: String,
    message_prefix: String,
    property_prefix: String,
    counter_metric: String,
    total_metric: String,
    command: String,
    settings: Vec<(String, String)>,
    runtime: Vec<(String, String)>,
    last_announced: Option<Instant>,
}

impl MessageRenderer {
    pub fn new(config: &SenderConfig, metadata: &ProcessMetadata) -> Result<Self, RenderError> {
        let entity = sanitize_name(&config.entity);
        if entity.is_empty() {
            return Err(RenderError::EmptyField("entity"));
        }

        let mut tags = String::new();
        for (key, value) in merge_tags(&config.tags) {
            write_tag(&mut tags, &key, &value);
        }

        let series_prefix = format!("series e:{entity}{tags}");
        let mut message_prefix = format!("message e:{entity}{tags}");
        write_tag(&mut message_prefix, "type", MESSAGE_TYPE);

        let scheme = config
            .destination
            .split_once("://")
            .map_or("", |(scheme, _)| scheme);
        let mut settings = vec![
            ("interval_ms".to_string(), config.interval_ms.to_string()),
            ("min_interval_ms".to_string(), config.min_interval_ms.to_string()),
            (
                "min_interval_threshold".to_string(),
                config.min_interval_threshold.to_string(),
            ),
            ("repeat_count".to_string(), config.repeat_count.to_string()),
            ("metric_prefix".to_string(), config.metric_prefix.clone()),
            (
                "skip_threshold".to_string(),
                config.effective_skip_threshold().to_string(),
            ),
            ("transport".to_string(), scheme.to_ascii_lowercase()),
            ("send_samples".to_string(), config.send_samples.to_string()),
        ];
        for trigger in config.effective_triggers() {
            settings.push((
                format!("trigger_{}", trigger.severity.to_string().to_lowercase()),
                format!(
                    "{}/{}",
                    trigger.effective_multiplier(),
                    trigger.effective_stack_lines()
                ),
            ));
        }

        let runtime = vec![
            ("pid".to_string(), metadata.pid.to_string()),
            ("hostname".to_string(), metadata.hostname.clone()),
            ("os".to_string(), metadata.os.clone()),
            ("arch".to_string(), metadata.arch.clone()),
            ("version".to_string(), metadata.version.clone()),
        ];

        Ok(MessageRenderer {
            series_prefix,
            message_prefix,
            property_prefix: format!("property e:{entity}"),
            counter_metric: sanitize_name(&config.counter_metric()),
            total_metric: sanitize_name(&config.total_counter_metric()),
            command: metadata.command.clone(),
            settings,
            runtime,
            last_announced: None,
        })
    }

    /// Per-key counter line.
    pub fn counter_line(&self, key: &str, label: &str, value: i64) -> Result<String, RenderError> {
        if key.is_empty() {
            return Err(RenderError::EmptyField("key"));
        }
        if label.is_empty() {
            return Err(RenderError::EmptyField("label"));
        }
        let mut line = self.series_prefix.clone();
        let _ = write!(line, " m:{}={value}", self.counter_metric);
        write_tag(&mut line, "level", label);
        write_tag(&mut line, "logger", key);
        Ok(line)
    }

    /// Per-label total line summed across keys.
    pub fn total_line(&self, label: &str, value: i64) -> Result<String, RenderError> {
        if label.is_empty() {
            return Err(RenderError::EmptyField("label"));
        }
        let mut line = self.series_prefix.clone();
        let _ = write!(line, " m:{}={value}", self.total_metric);
        write_tag(&mut line, "level", label);
        Ok(line)
    }

    pub fn message_line(&self, sample: &Sample) -> Result<String, RenderError> {
        if sample.key.is_empty() {
            return Err(RenderError::EmptyField("key"));
        }
        if sample.label.is_empty() {
            return Err(RenderError::EmptyField("label"));
        }

        let mut body = sample.message.clone();
        for frame in &sample.stack_trace {
            body.push('\n');
            body.push_str(frame);
        }

        let mut line = self.message_prefix.clone();
        let _ = write!(line, " m:{}", escape_value(&fold_newlines(&body)));
        write_tag(&mut line, "severity", &sample.severity.to_string());
        write_tag(&mut line, "level", &sample.label);
        write_tag(&mut line, "source", &sample.key);
        for (field, value) in merge_tags(sample.context.iter().map(|(k, v)| (k, v))) {
            write_tag(&mut line, &field, &value);
        }
        Ok(line)
    }

    /// Both metadata lines, settings first.
    #[must_use]
    pub fn property_lines(&self) -> Vec<String> {
        vec![
            self.property_line(SETTINGS_PROPERTY_TYPE, &self.settings),
            self.property_line(RUNTIME_PROPERTY_TYPE, &self.runtime),
        ]
    }

    fn property_line(&self, kind: &str, values: &[(String, String)]) -> String {
        let mut line = self.property_prefix.clone();
        let _ = write!(
            line,
            " t:{kind} k:command={}",
            escape_value(&sanitize_name(&self.command))
        );
        for (name, value) in values {
            let _ = write!(line, " v:{}={}", sanitize_name(name), escape_value(value));
        }
        line
    }

    /// Returns the metadata lines when they were never sent or have gone
    /// stale, and marks them sent at `now`.
    pub fn announce_if_stale(&mut self, now: Instant) -> Option<Vec<String>> {
        let stale = self
            .last_announced
            .map_or(true, |sent| now.saturating_duration_since(sent) > PROPERTY_STALENESS);
        if !stale {
            return None;
        }
        self.last_announced = Some(now);
        Some(self.property_lines())
    }
}
