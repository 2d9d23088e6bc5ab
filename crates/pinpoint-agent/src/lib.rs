// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process APM agent speaking the Pinpoint collector protocol.
//!
//! Instrumented code starts a [`Transaction`] per unit of work from an
//! [`Application`], records timed [`Segment`]s inside it and ends it. Ended
//! transactions are queued in a harvest buffer that a background
//! [`harvester::Harvester`] drains on a fixed interval, encoding each
//! record as a framed compact struct and handing the frames to a
//! [`transport::Transport`].
//!
//! Distributed traces cross process boundaries through the headers in
//! [`propagation`].
//!
//! Instrumentation never fails the host: transaction and segment calls
//! return no errors and turn into no-ops once a transaction has ended or
//! the agent has shut down.

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod aggregator;
pub mod application;
pub mod attribute;
pub mod config;
pub mod error;
pub mod harvester;
pub mod logger;
pub mod propagation;
pub mod trace_id;
pub mod transaction;
pub mod transport;
pub mod wire;

pub use application::Application;
pub use attribute::AttributeValue;
pub use config::Config;
pub use propagation::{headers_to_metadata, metadata_to_headers, CrossProcessMetadata};
pub use trace_id::TraceId;
pub use transaction::{Segment, Transaction};
