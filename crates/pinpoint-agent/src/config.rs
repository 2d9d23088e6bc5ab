// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::MAX_PENDING_TRANSACTIONS;
use crate::error::ConfigError;
use crate::trace_id::TRACE_ID_DELIMITER;

/// Longest application name or agent id the collector accepts.
pub const MAX_ID_LENGTH: usize = 24;

pub const DEFAULT_SERVICE_TYPE: i16 = 1000;

/// Collector endpoint. Spans and custom metrics share the TCP channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub ip: String,
    pub tcp_port: u16,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            tcp_port: 9994,
        }
    }
}

impl CollectorConfig {
    pub fn tcp_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = IpAddr::from_str(&self.ip)
            .map_err(|_| ConfigError::Invalid(format!("Invalid collector IP '{}'", self.ip)))?;
        Ok(SocketAddr::new(ip, self.tcp_port))
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// When false no harvest runs; finished transactions stay in the buffer
    pub enabled: bool,
    pub app_name: String,
    pub agent_id: String,
    pub service_type: i16,
    pub collector: CollectorConfig,
    pub flush_interval: Duration,
    pub max_pending_transactions: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            app_name: "pinpoint-app".to_string(),
            agent_id: "pinpoint-agent".to_string(),
            service_type: DEFAULT_SERVICE_TYPE,
            collector: CollectorConfig::default(),
            flush_interval: Duration::from_secs(3),
            max_pending_transactions: MAX_PENDING_TRANSACTIONS,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from `PINPOINT_*` environment variables.
    ///
    /// Unset variables keep their defaults; a set but unparsable one is an
    /// error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let collector = CollectorConfig {
            ip: env::var("PINPOINT_COLLECTOR_IP").unwrap_or(defaults.collector.ip),
            tcp_port: parse_env("PINPOINT_COLLECTOR_TCP_PORT")?
                .unwrap_or(defaults.collector.tcp_port),
        };

        let config = Self {
            enabled: parse_env("PINPOINT_ENABLED")?.unwrap_or(defaults.enabled),
            app_name: env::var("PINPOINT_APP_NAME").unwrap_or(defaults.app_name),
            agent_id: env::var("PINPOINT_AGENT_ID").unwrap_or(defaults.agent_id),
            service_type: defaults.service_type,
            collector,
            flush_interval: parse_env::<u64>("PINPOINT_FLUSH_INTERVAL_SECS")?
                .map_or(defaults.flush_interval, Duration::from_secs),
            max_pending_transactions: defaults.max_pending_transactions,
            log_level: env::var("PINPOINT_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id("application name", &self.app_name)?;
        validate_id("agent id", &self.agent_id)?;
        if self.agent_id.contains(TRACE_ID_DELIMITER) {
            return Err(ConfigError::Invalid(format!(
                "Agent id '{}' must not contain '{TRACE_ID_DELIMITER}'",
                self.agent_id
            )));
        }

        if self.collector.ip.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Collector IP cannot be empty".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Flush interval must be greater than 0".to_string(),
            ));
        }
        if self.max_pending_transactions == 0 {
            return Err(ConfigError::Invalid(
                "Pending transaction limit must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn validate_id(what: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("The {what} cannot be empty")));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(ConfigError::Invalid(format!(
            "The {what} '{value}' is longer than {MAX_ID_LENGTH} bytes"
        )));
    }
    Ok(())
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .to_lowercase()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("Invalid value '{raw}' for {name}"))),
        Err(_) => Ok(None),
    }
}
