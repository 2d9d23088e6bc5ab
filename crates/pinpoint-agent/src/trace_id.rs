// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed trace id codec.
//!
//! A trace id correlates work across processes. Its string form is
//! `agentId^startTime^sequenceId`, where `startTime` is the originating
//! agent's start time in epoch millis and `sequenceId` is that agent's
//! per-transaction counter.

use std::fmt;
use std::str::FromStr;

use crate::error::MalformedTraceId;

pub const TRACE_ID_DELIMITER: char = '^';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId {
    pub agent_id: String,
    /// Epoch millis.
    pub start_time: i64,
    pub sequence_id: i64,
}

impl TraceId {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, start_time: i64, sequence_id: i64) -> Self {
        Self {
            agent_id: agent_id.into(),
            start_time,
            sequence_id,
        }
    }

    /// Same originating agent and start time, fresh sequence.
    #[must_use]
    pub fn with_sequence(&self, sequence_id: i64) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            start_time: self.start_time,
            sequence_id,
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{TRACE_ID_DELIMITER}{}{TRACE_ID_DELIMITER}{}",
            self.agent_id, self.start_time, self.sequence_id
        )
    }
}

impl FromStr for TraceId {
    type Err = MalformedTraceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

/// Builds the string form of a trace id.
///
/// `agent_id` must not contain `^`; that is not checked here.
#[must_use]
pub fn encode(agent_id: &str, start_time: i64, sequence_id: i64) -> String {
    format!("{agent_id}{TRACE_ID_DELIMITER}{start_time}{TRACE_ID_DELIMITER}{sequence_id}")
}

pub fn decode(s: &str) -> Result<TraceId, MalformedTraceId> {
    let mut parts = s.split(TRACE_ID_DELIMITER);
    let (Some(agent_id), Some(start_time), Some(sequence_id), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(MalformedTraceId::new(s, "expected exactly 3 '^'-separated fields"));
    };

    if agent_id.is_empty() || start_time.is_empty() || sequence_id.is_empty() {
        return Err(MalformedTraceId::new(s, "empty field"));
    }

    let start_time = start_time
        .parse::<i64>()
        .map_err(|_| MalformedTraceId::new(s, "start time is not a base-10 i64"))?;
    let sequence_id = sequence_id
        .parse::<i64>()
        .map_err(|_| MalformedTraceId::new(s, "sequence id is not a base-10 i64"))?;

    Ok(TraceId {
        agent_id: agent_id.to_string(),
        start_time,
        sequence_id,
    })
}
