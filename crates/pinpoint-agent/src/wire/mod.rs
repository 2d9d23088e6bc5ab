// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector wire format: compact struct bodies inside versioned frames.

pub mod compact;
pub mod frame;
pub mod metric;
pub mod span;

pub use compact::{CompactStruct, CompactWriter, EmptyStruct};
pub use frame::{encode_frame, encode_transport_frame, message_type, TransportHeader};

/// Fields every record repeats to identify the sending agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub app_name: String,
    /// Epoch millis.
    pub agent_start_time: i64,
    pub service_type: i16,
}
