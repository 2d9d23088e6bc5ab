// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-process propagation of trace context.
//!
//! Inbound requests carry the caller's trace id, the span id the callee
//! should use, the caller's span id and the caller's application name and
//! type. Extraction is best effort: a missing or garbled header never fails
//! the request, it only means "no incoming trace context".
//!
//! ```text
//! inbound headers --headers_to_metadata--> CrossProcessMetadata
//!                                              |
//!                          Application::start_transaction_with_metadata
//!                                              |
//!                     Transaction::outbound_metadata --metadata_to_headers--> outbound headers
//! ```

use std::collections::HashMap;

use tracing::debug;

use crate::trace_id::{self, TraceId};
use carrier::{Extractor, Injector};

pub mod carrier;

pub const TRACE_ID_HEADER: &str = "Pinpoint-TraceID";
pub const SPAN_ID_HEADER: &str = "Pinpoint-SpanID";
pub const PARENT_SPAN_ID_HEADER: &str = "Pinpoint-pSpanID";
pub const FLAGS_HEADER: &str = "Pinpoint-Flags";
pub const PARENT_APP_NAME_HEADER: &str = "Pinpoint-pAppName";
pub const PARENT_APP_TYPE_HEADER: &str = "Pinpoint-pAppType";

/// Parent span id of a trace root.
pub const NO_PARENT_SPAN_ID: i64 = -1;

/// Trace context received from, or sent to, another process.
///
/// Built once from headers and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossProcessMetadata {
    pub trace_id: String,
    /// `None` unless `trace_id` decoded cleanly.
    pub trace_id_decoded: Option<TraceId>,
    pub app_name: String,
    pub app_type: i16,
    pub parent_span_id: i64,
    pub span_id: i64,
    pub flags: String,
}

impl Default for CrossProcessMetadata {
    fn default() -> Self {
        Self {
            trace_id: String::new(),
            trace_id_decoded: None,
            app_name: String::new(),
            app_type: 0,
            parent_span_id: NO_PARENT_SPAN_ID,
            span_id: 0,
            flags: String::new(),
        }
    }
}

impl CrossProcessMetadata {
    /// Whether this metadata continues a distributed trace.
    #[must_use]
    pub fn has_trace(&self) -> bool {
        self.trace_id_decoded.is_some()
    }

    /// Numeric form of `flags`; anything unparsable reads as 0.
    #[must_use]
    pub fn flags_value(&self) -> i16 {
        self.flags.parse().unwrap_or(0)
    }
}

/// Reads inbound propagation headers.
///
/// The trace id, application type, parent span id and span id are
/// required. If any of them is absent or unparsable the result is the
/// default metadata (`parent_span_id == -1`). Application name and flags
/// are optional.
#[must_use]
pub fn headers_to_metadata(carrier: &dyn Extractor) -> CrossProcessMetadata {
    match try_headers_to_metadata(carrier) {
        Ok(metadata) => metadata,
        Err(reason) => {
            debug!("Ignoring inbound trace context: {reason}");
            CrossProcessMetadata::default()
        }
    }
}

fn try_headers_to_metadata(carrier: &dyn Extractor) -> Result<CrossProcessMetadata, String> {
    let trace_id = carrier
        .get(TRACE_ID_HEADER)
        .ok_or_else(|| format!("missing {TRACE_ID_HEADER}"))?;
    let decoded = trace_id::decode(trace_id).map_err(|e| e.to_string())?;

    let app_type = parse_required::<i16>(carrier, PARENT_APP_TYPE_HEADER)?;
    let parent_span_id = parse_required::<i64>(carrier, PARENT_SPAN_ID_HEADER)?;
    let span_id = parse_required::<i64>(carrier, SPAN_ID_HEADER)?;

    Ok(CrossProcessMetadata {
        trace_id: trace_id.to_string(),
        trace_id_decoded: Some(decoded),
        app_name: carrier
            .get(PARENT_APP_NAME_HEADER)
            .unwrap_or_default()
            .to_string(),
        app_type,
        parent_span_id,
        span_id,
        flags: carrier.get(FLAGS_HEADER).unwrap_or_default().to_string(),
    })
}

fn parse_required<T: std::str::FromStr>(
    carrier: &dyn Extractor,
    header: &str,
) -> Result<T, String> {
    let raw = carrier
        .get(header)
        .ok_or_else(|| format!("missing {header}"))?;
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("unparsable {header}: {raw:?}"))
}

/// Writes outbound propagation headers.
///
/// Empty string fields are omitted. Without a trace id nothing is written,
/// since the numeric fields mean nothing on their own.
pub fn inject_metadata(metadata: &CrossProcessMetadata, carrier: &mut dyn Injector) {
    if metadata.trace_id.is_empty() {
        return;
    }
    carrier.set(TRACE_ID_HEADER, metadata.trace_id.clone());
    carrier.set(SPAN_ID_HEADER, metadata.span_id.to_string());
    carrier.set(PARENT_SPAN_ID_HEADER, metadata.parent_span_id.to_string());
    carrier.set(PARENT_APP_TYPE_HEADER, metadata.app_type.to_string());
    if !metadata.app_name.is_empty() {
        carrier.set(PARENT_APP_NAME_HEADER, metadata.app_name.clone());
    }
    if !metadata.flags.is_empty() {
        carrier.set(FLAGS_HEADER, metadata.flags.clone());
    }
}

/// Inverse of [`headers_to_metadata`], as a fresh header set.
#[must_use]
pub fn metadata_to_headers(metadata: &CrossProcessMetadata) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    inject_metadata(metadata, &mut headers);
    headers
}
