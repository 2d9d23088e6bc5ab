// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent's process-wide state and its entry points.
//!
//! An [`Application`] owns the agent identity, the sequence and span id
//! counters, the harvest buffer and the background harvester. Transactions
//! keep a reference to the shared state instead of reaching for globals.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::HarvestBuffer;
use crate::config::Config;
use crate::error::{ConfigError, HarvestError};
use crate::harvester::Harvester;
use crate::propagation::{CrossProcessMetadata, NO_PARENT_SPAN_ID};
use crate::trace_id::TraceId;
use crate::transaction::{Transaction, TransactionOrigin};
use crate::transport::Transport;
use crate::wire::AgentIdentity;

/// State shared by the application and every transaction it starts.
#[derive(Debug)]
pub(crate) struct AgentState {
    pub(crate) identity: AgentIdentity,
    pub(crate) buffer: Arc<HarvestBuffer>,
    sequence: AtomicI64,
    span_ids: AtomicI64,
    shut_down: AtomicBool,
}

impl AgentState {
    pub(crate) fn new(identity: AgentIdentity, buffer: Arc<HarvestBuffer>) -> Self {
        // Distinct per agent start.
        let span_seed = identity.agent_start_time.wrapping_shl(16);
        Self {
            identity,
            buffer,
            sequence: AtomicI64::new(1),
            span_ids: AtomicI64::new(span_seed),
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_span_id(&self) -> i64 {
        self.span_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Returns false if the agent was already shut down.
    pub(crate) fn shut_down(&self) -> bool {
        !self.shut_down.swap(true, Ordering::AcqRel)
    }
}

enum HarvestTask {
    Running {
        cancel: CancellationToken,
        join: JoinHandle<()>,
    },
    /// Created outside a Tokio runtime; only the final flush runs.
    Idle(Harvester),
}

pub struct Application {
    agent: Arc<AgentState>,
    harvest: Mutex<Option<HarvestTask>>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("identity", &self.agent.identity)
            .field("shut_down", &self.agent.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Starts the agent.
    ///
    /// Inside a Tokio runtime the harvester is spawned right away. With
    /// `enabled = false` no harvester exists and finished transactions
    /// accumulate in [`Application::harvest_buffer`].
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;

        let agent_start_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        let identity = AgentIdentity {
            agent_id: config.agent_id,
            app_name: config.app_name,
            agent_start_time,
            service_type: config.service_type,
        };
        let buffer = Arc::new(HarvestBuffer::new(config.max_pending_transactions));
        let agent = Arc::new(AgentState::new(identity.clone(), Arc::clone(&buffer)));

        let harvest = if config.enabled {
            let harvester = Harvester::new(buffer, transport, identity, config.flush_interval);
            Some(match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let cancel = CancellationToken::new();
                    let join = runtime.spawn(harvester.run(cancel.clone()));
                    HarvestTask::Running { cancel, join }
                }
                Err(_) => {
                    debug!("No Tokio runtime, periodic harvest disabled");
                    HarvestTask::Idle(harvester)
                }
            })
        } else {
            info!("Pinpoint agent disabled, nothing will be sent to the collector");
            None
        };

        info!(
            "Pinpoint agent started: app {} agent {}",
            agent.identity.app_name, agent.identity.agent_id
        );
        Ok(Self {
            agent,
            harvest: Mutex::new(harvest),
        })
    }

    #[must_use]
    pub fn identity(&self) -> &AgentIdentity {
        &self.agent.identity
    }

    #[must_use]
    pub fn harvest_buffer(&self) -> &Arc<HarvestBuffer> {
        &self.agent.buffer
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.agent.is_shut_down()
    }

    /// Starts a transaction at the root of a new distributed trace.
    #[must_use]
    pub fn start_transaction(&self, name: impl Into<String>) -> Transaction {
        let origin = TransactionOrigin {
            trace_id: TraceId::new(
                self.agent.identity.agent_id.clone(),
                self.agent.identity.agent_start_time,
                self.agent.next_sequence(),
            ),
            span_id: self.agent.next_span_id(),
            parent_span_id: NO_PARENT_SPAN_ID,
            parent_app_name: None,
            parent_app_type: None,
            flags: 0,
        };
        self.transaction(name.into(), origin)
    }

    /// Starts a transaction continuing the trace described by `metadata`.
    ///
    /// Metadata without a decoded trace id starts a new trace.
    #[must_use]
    pub fn start_transaction_with_metadata(
        &self,
        name: impl Into<String>,
        metadata: &CrossProcessMetadata,
    ) -> Transaction {
        let Some(trace_id) = &metadata.trace_id_decoded else {
            return self.start_transaction(name);
        };
        let origin = TransactionOrigin {
            trace_id: trace_id.clone(),
            span_id: metadata.span_id,
            parent_span_id: metadata.parent_span_id,
            parent_app_name: Some(metadata.app_name.clone()).filter(|name| !name.is_empty()),
            parent_app_type: Some(metadata.app_type),
            flags: metadata.flags_value(),
        };
        self.transaction(name.into(), origin)
    }

    fn transaction(&self, name: String, origin: TransactionOrigin) -> Transaction {
        if self.agent.is_shut_down() {
            Transaction::disabled(Arc::clone(&self.agent), name, origin)
        } else {
            Transaction::start(Arc::clone(&self.agent), name, origin)
        }
    }

    /// Adds one sample to the custom metric `name`.
    pub fn record_custom_metric(&self, name: &str, value: f64) {
        if !self.agent.is_shut_down() {
            self.agent.buffer.record_metric(name, value);
        }
    }

    /// Runs a final harvest and disables the agent.
    ///
    /// Transactions ending after this call are discarded. If the final
    /// harvest does not finish within `timeout` it is abandoned and
    /// whatever it had not sent yet is lost.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), HarvestError> {
        if !self.agent.shut_down() {
            return Err(HarvestError::AlreadyShutdown);
        }
        let task = self
            .harvest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let finished = match task {
            None => true,
            Some(HarvestTask::Running { cancel, mut join }) => {
                cancel.cancel();
                match tokio::time::timeout(timeout, &mut join).await {
                    Ok(result) => {
                        if let Err(e) = result {
                            warn!("Harvester task failed: {e}");
                        }
                        true
                    }
                    Err(_) => {
                        join.abort();
                        false
                    }
                }
            }
            Some(HarvestTask::Idle(mut harvester)) => {
                tokio::time::timeout(timeout, harvester.flush()).await.is_ok()
            }
        };

        if finished {
            info!("Pinpoint agent shut down");
            Ok(())
        } else {
            warn!("Final harvest timed out after {timeout:?}, dropping pending data");
            Err(HarvestError::ShutdownTimeout(timeout))
        }
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        let harvest = self
            .harvest
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(HarvestTask::Running { cancel, .. }) = harvest {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::propagation::headers_to_metadata;
    use crate::transport::ChannelTransport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn config() -> Config {
        Config {
            app_name: "orders".to_string(),
            agent_id: "orders-1".to_string(),
            ..Default::default()
        }
    }

    fn disabled() -> Application {
        let (transport, _rx) = ChannelTransport::channel(1);
        let config = Config {
            enabled: false,
            ..config()
        };
        Application::new(config, Arc::new(transport)).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (transport, _rx) = ChannelTransport::channel(1);
        let config = Config {
            agent_id: "bad^id".to_string(),
            ..config()
        };
        assert!(Application::new(config, Arc::new(transport)).is_err());
    }

    #[test]
    fn test_start_transaction_allocates_ids() {
        let app = disabled();
        let one = app.start_transaction("one");
        let two = app.start_transaction("two");

        assert_eq!(one.trace_id().agent_id, "orders-1");
        assert_eq!(one.trace_id().start_time, app.identity().agent_start_time);
        assert_eq!(two.trace_id().sequence_id, one.trace_id().sequence_id + 1);
        assert_ne!(one.span_id(), two.span_id());
        assert_eq!(one.parent_span_id(), NO_PARENT_SPAN_ID);
    }

    #[test]
    fn test_disabled_agent_keeps_records_in_buffer() {
        let app = disabled();
        app.start_transaction("t").end();
        app.record_custom_metric("m", 2.0);
        assert_eq!(app.harvest_buffer().pending_transactions(), 1);
    }

    #[test]
    fn test_continue_inbound_trace() {
        let app = disabled();
        let mut headers = HashMap::new();
        headers.insert("pinpoint-traceid".to_string(), "front^1600000000000^9".to_string());
        headers.insert("pinpoint-spanid".to_string(), "555".to_string());
        headers.insert("pinpoint-pspanid".to_string(), "444".to_string());
        headers.insert("pinpoint-pappname".to_string(), "front".to_string());
        headers.insert("pinpoint-papptype".to_string(), "1000".to_string());
        headers.insert("pinpoint-flags".to_string(), "1".to_string());

        let txn = app.start_transaction_with_metadata("GET /", &headers_to_metadata(&headers));
        assert_eq!(txn.trace_id(), &TraceId::new("front", 1_600_000_000_000, 9));
        assert_eq!(txn.span_id(), 555);
        assert_eq!(txn.parent_span_id(), 444);
        txn.end();

        let record = app.harvest_buffer().take().transactions.pop_front().unwrap();
        assert_eq!(record.parent_app_name.as_deref(), Some("front"));
        assert_eq!(record.parent_app_type, Some(1000));
        assert_eq!(record.flags, 1);
    }

    #[test]
    fn test_metadata_without_trace_starts_new_trace() {
        let app = disabled();
        let txn = app.start_transaction_with_metadata("t", &CrossProcessMetadata::default());
        assert_eq!(txn.trace_id().agent_id, "orders-1");
        assert_eq!(txn.parent_span_id(), NO_PARENT_SPAN_ID);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_disables() {
        let (transport, mut rx) = ChannelTransport::channel(16);
        let app = Application::new(config(), Arc::new(transport)).unwrap();
        let txn = app.start_transaction("t");
        txn.end();
        app.record_custom_metric("m", 1.0);

        app.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());

        let late = app.start_transaction("late");
        late.start_segment("s", None);
        late.end();
        app.record_custom_metric("m", 1.0);
        assert!(app.harvest_buffer().is_empty());
        assert_eq!(
            app.shutdown(Duration::from_secs(1)).await,
            Err(HarvestError::AlreadyShutdown)
        );
    }

    #[test]
    fn test_shutdown_without_runtime_harvester() {
        let (transport, mut rx) = ChannelTransport::channel(16);
        let app = Application::new(config(), Arc::new(transport)).unwrap();
        app.start_transaction("t").end();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime
            .block_on(app.shutdown(Duration::from_secs(5)))
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    struct StuckTransport;

    #[async_trait]
    impl Transport for StuckTransport {
        async fn send(&self, _frame: Bytes) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout() {
        let app = Application::new(config(), Arc::new(StuckTransport)).unwrap();
        app.start_transaction("t").end();

        let result = app.shutdown(Duration::from_millis(200)).await;
        assert_eq!(
            result,
            Err(HarvestError::ShutdownTimeout(Duration::from_millis(200)))
        );
        assert!(app.is_shut_down());
    }
}
