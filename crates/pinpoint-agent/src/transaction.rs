// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transactions and their segment trees.
//!
//! A [`Transaction`] is a cheap, cloneable handle. Every clone refers to the
//! same state, guarded by one mutex, so the handle can be passed to any
//! thread or task taking part in the same unit of work. [`Segment`] handles
//! point back into that state; the active segment is always passed
//! explicitly by the caller.
//!
//! Nothing here returns an error or blocks beyond the state lock. Calls on
//! an ended transaction, or after the agent is shut down, are ignored.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tracing::debug;

use crate::application::AgentState;
use crate::attribute::{self, AttributeValue};
use crate::propagation::{carrier::Injector, inject_metadata, CrossProcessMetadata};
use crate::trace_id::TraceId;

/// A finished transaction, as queued for the next harvest.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub trace_id: TraceId,
    pub name: String,
    pub span_id: i64,
    pub parent_span_id: i64,
    pub parent_app_name: Option<String>,
    pub parent_app_type: Option<i16>,
    pub flags: i16,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub attributes: HashMap<String, AttributeValue>,
    pub error: Option<String>,
    /// In span id order, which is also start order.
    pub segments: Vec<SegmentRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub span_id: i64,
    pub parent_span_id: i64,
    pub name: String,
    pub start_time: SystemTime,
    /// `None` if the segment was still open when the transaction ended.
    pub end_time: Option<SystemTime>,
    pub attributes: HashMap<String, AttributeValue>,
    /// Span id handed to a downstream service from inside this segment.
    pub next_span_id: Option<i64>,
}

/// Where a new transaction sits in the distributed trace.
#[derive(Debug, Clone)]
pub(crate) struct TransactionOrigin {
    pub(crate) trace_id: TraceId,
    pub(crate) span_id: i64,
    pub(crate) parent_span_id: i64,
    pub(crate) parent_app_name: Option<String>,
    pub(crate) parent_app_type: Option<i16>,
    pub(crate) flags: i16,
}

struct TransactionInner {
    agent: Arc<AgentState>,
    trace_id: TraceId,
    span_id: i64,
    parent_span_id: i64,
    parent_app_name: Option<String>,
    parent_app_type: Option<i16>,
    flags: i16,
    start_time: SystemTime,
    state: Mutex<TransactionState>,
}

struct TransactionState {
    name: String,
    ended: bool,
    segments: Vec<SegmentRecord>,
    attributes: HashMap<String, AttributeValue>,
    error: Option<String>,
}

impl TransactionInner {
    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the state unless the transaction is closed to mutation.
    fn with_open_state<R>(&self, f: impl FnOnce(&mut TransactionState) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.ended || self.agent.is_shut_down() {
            return None;
        }
        Some(f(&mut state))
    }
}

#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("trace_id", &self.inner.trace_id)
            .field("span_id", &self.inner.span_id)
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn start(agent: Arc<AgentState>, name: String, origin: TransactionOrigin) -> Self {
        Self::build(agent, name, origin, false)
    }

    /// A transaction that ignores every call, handed out after shutdown.
    pub(crate) fn disabled(agent: Arc<AgentState>, name: String, origin: TransactionOrigin) -> Self {
        Self::build(agent, name, origin, true)
    }

    fn build(agent: Arc<AgentState>, name: String, origin: TransactionOrigin, ended: bool) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                agent,
                trace_id: origin.trace_id,
                span_id: origin.span_id,
                parent_span_id: origin.parent_span_id,
                parent_app_name: origin.parent_app_name,
                parent_app_type: origin.parent_app_type,
                flags: origin.flags,
                start_time: SystemTime::now(),
                state: Mutex::new(TransactionState {
                    name,
                    ended,
                    segments: Vec::new(),
                    attributes: HashMap::new(),
                    error: None,
                }),
            }),
        }
    }

    #[must_use]
    pub fn trace_id(&self) -> &TraceId {
        &self.inner.trace_id
    }

    #[must_use]
    pub fn span_id(&self) -> i64 {
        self.inner.span_id
    }

    #[must_use]
    pub fn parent_span_id(&self) -> i64 {
        self.inner.parent_span_id
    }

    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.inner.start_time
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }

    /// Segments started so far; zero once the transaction has ended and
    /// its segments have moved to the harvest.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<AttributeValue> {
        self.inner.lock().attributes.get(key).cloned()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.inner.with_open_state(|state| state.name = name);
    }

    pub fn add_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let (key, value) = (key.into(), value.into());
        self.inner.with_open_state(|state| {
            state.attributes.insert(key, value);
        });
    }

    /// Marks the transaction as failed and records `message` as its exception.
    pub fn notice_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.inner.with_open_state(|state| {
            state
                .attributes
                .insert(attribute::EXCEPTION.to_string(), AttributeValue::from(message.as_str()));
            state.error = Some(message);
        });
    }

    /// Starts a segment under `parent`, or directly under the transaction
    /// root when `parent` is `None`.
    ///
    /// A parent belonging to another transaction is ignored. On an ended
    /// transaction this returns a detached handle and changes nothing.
    pub fn start_segment(&self, name: impl Into<String>, parent: Option<&Segment>) -> Segment {
        let parent_span_id = match parent {
            Some(parent) if parent.belongs_to(&self.inner) => parent.span_id,
            Some(_) => {
                debug!("Segment parent belongs to another transaction, using the root span");
                self.inner.span_id
            }
            None => self.inner.span_id,
        };
        let name = name.into();

        self.inner
            .with_open_state(|state| {
                let span_id = self.inner.agent.next_span_id();
                state.segments.push(SegmentRecord {
                    span_id,
                    parent_span_id,
                    name,
                    start_time: SystemTime::now(),
                    end_time: None,
                    attributes: HashMap::new(),
                    next_span_id: None,
                });
                Segment {
                    txn: Some(Arc::clone(&self.inner)),
                    index: state.segments.len() - 1,
                    span_id,
                }
            })
            .unwrap_or_else(Segment::detached)
    }

    /// Creates a linked child transaction for work that outlives the
    /// current call path, linked to this transaction's root span.
    #[must_use]
    pub fn new_goroutine(&self, name: impl Into<String>) -> Transaction {
        self.linked_child(name.into(), self.inner.span_id)
    }

    /// Like [`Transaction::new_goroutine`], linked to `segment` instead of
    /// the root span.
    #[must_use]
    pub fn new_goroutine_from(&self, name: impl Into<String>, segment: &Segment) -> Transaction {
        let link = if segment.belongs_to(&self.inner) {
            segment.span_id
        } else {
            self.inner.span_id
        };
        self.linked_child(name.into(), link)
    }

    fn linked_child(&self, name: String, parent_span_id: i64) -> Transaction {
        let agent = &self.inner.agent;
        let origin = TransactionOrigin {
            trace_id: self.inner.trace_id.with_sequence(agent.next_sequence()),
            span_id: agent.next_span_id(),
            parent_span_id,
            parent_app_name: Some(agent.identity.app_name.clone()),
            parent_app_type: Some(agent.identity.service_type),
            flags: self.inner.flags,
        };
        if self.inner.with_open_state(|_| ()).is_some() {
            Transaction::start(Arc::clone(agent), name, origin)
        } else {
            Transaction::disabled(Arc::clone(agent), name, origin)
        }
    }

    /// Trace context for a call to another service.
    ///
    /// Allocates the span id the callee will use and, when `segment` is
    /// given, records it on that segment. Returns default metadata on an
    /// ended transaction.
    pub fn outbound_metadata(&self, segment: Option<&Segment>) -> CrossProcessMetadata {
        let agent = &self.inner.agent;
        let recorded = self.inner.with_open_state(|state| {
            let next_span_id = agent.next_span_id();
            if let Some(segment) = segment.filter(|s| s.belongs_to(&self.inner)) {
                if let Some(record) = state.segments.get_mut(segment.index) {
                    record.next_span_id = Some(next_span_id);
                }
            }
            next_span_id
        });
        let Some(next_span_id) = recorded else {
            return CrossProcessMetadata::default();
        };

        CrossProcessMetadata {
            trace_id: self.inner.trace_id.to_string(),
            trace_id_decoded: Some(self.inner.trace_id.clone()),
            app_name: agent.identity.app_name.clone(),
            app_type: agent.identity.service_type,
            parent_span_id: self.inner.span_id,
            span_id: next_span_id,
            flags: self.inner.flags.to_string(),
        }
    }

    pub fn outbound_headers(&self, segment: Option<&Segment>, carrier: &mut dyn Injector) {
        inject_metadata(&self.outbound_metadata(segment), carrier);
    }

    /// Ends the transaction and queues it for the next harvest.
    ///
    /// Only the first call has any effect. Segments still open are
    /// reported as ending with the transaction.
    pub fn end(&self) {
        let record = {
            let mut state = self.inner.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            if self.inner.agent.is_shut_down() {
                return;
            }
            TransactionRecord {
                trace_id: self.inner.trace_id.clone(),
                name: state.name.clone(),
                span_id: self.inner.span_id,
                parent_span_id: self.inner.parent_span_id,
                parent_app_name: self.inner.parent_app_name.clone(),
                parent_app_type: self.inner.parent_app_type,
                flags: self.inner.flags,
                start_time: self.inner.start_time,
                end_time: SystemTime::now(),
                attributes: mem::take(&mut state.attributes),
                error: state.error.take(),
                segments: mem::take(&mut state.segments),
            }
        };
        self.inner.agent.buffer.push_transaction(record);
    }
}

/// Handle to one segment of a transaction.
///
/// A detached handle, returned when the transaction was already ended,
/// ignores every call and reads as ended.
#[derive(Clone)]
pub struct Segment {
    txn: Option<Arc<TransactionInner>>,
    index: usize,
    span_id: i64,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("span_id", &self.span_id)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Segment {
    fn detached() -> Self {
        Self {
            txn: None,
            index: 0,
            span_id: crate::propagation::NO_PARENT_SPAN_ID,
        }
    }

    fn belongs_to(&self, txn: &Arc<TransactionInner>) -> bool {
        self.txn.as_ref().is_some_and(|own| Arc::ptr_eq(own, txn))
    }

    /// -1 for a detached handle.
    #[must_use]
    pub fn span_id(&self) -> i64 {
        self.span_id
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.txn.is_none()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        let Some(txn) = &self.txn else {
            return true;
        };
        let state = txn.lock();
        state.ended
            || !matches!(state.segments.get(self.index), Some(record) if record.end_time.is_none())
    }

    /// Sets the end time. Only the first call has any effect.
    pub fn end(&self) {
        self.with_open_record(|record| record.end_time = Some(SystemTime::now()));
    }

    pub fn add_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let (key, value) = (key.into(), value.into());
        self.with_open_record(|record| {
            record.attributes.insert(key, value);
        });
    }

    /// Starts a segment nested under this one.
    pub fn start_child(&self, name: impl Into<String>) -> Segment {
        match &self.txn {
            Some(txn) => Transaction {
                inner: Arc::clone(txn),
            }
            .start_segment(name, Some(self)),
            None => Segment::detached(),
        }
    }

    fn with_open_record(&self, f: impl FnOnce(&mut SegmentRecord)) {
        let Some(txn) = &self.txn else {
            return;
        };
        txn.with_open_state(|state| match state.segments.get_mut(self.index) {
            Some(record) if record.end_time.is_none() => f(record),
            _ => {}
        });
    }
}
