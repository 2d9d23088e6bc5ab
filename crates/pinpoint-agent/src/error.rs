// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the agent.
//!
//! None of these ever reach the instrumented application through the
//! transaction or segment API. They surface only from the codec, the wire
//! encoder, the transport boundary, configuration and `shutdown`.

use std::time::Duration;

use thiserror::Error;

/// A distributed trace id that could not be decoded.
///
/// Propagation treats this as "no incoming trace context".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed trace id {input:?}: {reason}")]
pub struct MalformedTraceId {
    input: String,
    reason: &'static str,
}

impl MalformedTraceId {
    #[must_use]
    pub fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }

    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// A record that cannot be written in the collector's struct encoding.
///
/// The harvester drops the offending record and keeps going.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("field {field} holds a non-finite double ({value})")]
    NonFiniteDouble { field: &'static str, value: f64 },

    #[error("{what} length {len} does not fit the compact protocol")]
    LengthOverflow { what: &'static str, len: usize },
}

/// Failures of the transport boundary.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("collector I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collector did not respond within {0:?}")]
    Timeout(Duration),

    #[error("transport is closed")]
    Closed,
}

/// Errors reported by `Application::shutdown`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarvestError {
    #[error("final harvest did not complete within {0:?}, pending data dropped")]
    ShutdownTimeout(Duration),

    #[error("agent already shut down")]
    AlreadyShutdown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
