// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic harvest of the pending buffer.
//!
//! ```text
//!          tick / cancel
//!   Idle ----------------> Flushing
//!    ^                        |
//!    +------------------------+
//!      frames handed to transport
//! ```
//!
//! A flush swaps the pending buffer out, encodes every record into a
//! transport frame and sends the frames in order. A record that cannot be
//! encoded is logged and dropped; a frame the transport rejects is logged
//! and lost. Neither stops the rest of the flush.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregator::{Harvest, HarvestBuffer};
use crate::error::EncodeError;
use crate::transport::Transport;
use crate::wire::metric::CustomMetric;
use crate::wire::span::Span;
use crate::wire::{encode_transport_frame, message_type, AgentIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    Idle,
    Flushing,
}

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub sent: usize,
    /// Records dropped because they could not be encoded.
    pub dropped: usize,
    /// Frames the transport rejected.
    pub failed: usize,
}

pub struct Harvester {
    buffer: Arc<HarvestBuffer>,
    transport: Arc<dyn Transport>,
    identity: AgentIdentity,
    flush_interval: Duration,
    next_message_id: u32,
    state: HarvestState,
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvester")
            .field("identity", &self.identity)
            .field("flush_interval", &self.flush_interval)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Harvester {
    #[must_use]
    pub fn new(
        buffer: Arc<HarvestBuffer>,
        transport: Arc<dyn Transport>,
        identity: AgentIdentity,
        flush_interval: Duration,
    ) -> Self {
        Self {
            buffer,
            transport,
            identity,
            flush_interval,
            next_message_id: 0,
            state: HarvestState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> HarvestState {
        self.state
    }

    /// Flushes on every interval tick until `cancel` fires, then flushes
    /// one last time.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Harvester cancelled, running final flush");
                    self.flush().await;
                    return;
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }

    pub async fn flush(&mut self) -> FlushSummary {
        self.state = HarvestState::Flushing;
        let harvest = self.buffer.take();
        let mut summary = FlushSummary::default();

        if !harvest.is_empty() {
            let frames = self.encode(harvest, &mut summary);
            for frame in frames {
                match self.transport.send(frame).await {
                    Ok(()) => summary.sent += 1,
                    Err(e) => {
                        warn!("Failed to send frame to collector: {e}");
                        summary.failed += 1;
                    }
                }
            }
            debug!(
                "Harvest done: {} sent, {} dropped, {} failed",
                summary.sent, summary.dropped, summary.failed
            );
        }

        self.state = HarvestState::Idle;
        summary
    }

    fn encode(&mut self, harvest: Harvest, summary: &mut FlushSummary) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(harvest.transactions.len() + harvest.metrics.len());

        for record in &harvest.transactions {
            let next_id = &mut self.next_message_id;
            let encoded = Span::new(&self.identity, record).and_then(|span| {
                encode_transport_frame(take_message_id(next_id), message_type::SPAN, &span)
            });
            self.collect(encoded, &mut frames, summary, || {
                format!("transaction {}", record.trace_id)
            });
        }

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        let mut metrics: Vec<_> = harvest.metrics.iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(b.0));
        for (name, aggregate) in metrics {
            let message_id = take_message_id(&mut self.next_message_id);
            let metric = CustomMetric {
                agent: &self.identity,
                timestamp,
                name,
                aggregate: *aggregate,
            };
            let encoded = encode_transport_frame(message_id, message_type::CUSTOM_METRIC, &metric);
            self.collect(encoded, &mut frames, summary, || format!("metric {name}"));
        }

        frames
    }

    fn collect(
        &self,
        encoded: Result<Bytes, EncodeError>,
        frames: &mut Vec<Bytes>,
        summary: &mut FlushSummary,
        what: impl FnOnce() -> String,
    ) {
        match encoded {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                warn!("Dropping {} from harvest: {e}", what());
                summary.dropped += 1;
            }
        }
    }
}

fn take_message_id(next: &mut u32) -> u32 {
    let id = *next;
    *next = next.wrapping_add(1);
    id
}
