// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pending harvest data.
//!
//! Producers push finished transactions and metric samples under a short
//! lock. The harvester swaps the whole pending [`Harvest`] out for an empty
//! one, so encoding and sending never hold the lock.
//!
//! The transaction queue is bounded. When it is full the oldest entry is
//! dropped, which keeps memory flat while the collector is unreachable.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::transaction::TransactionRecord;

/// Default bound on queued transactions between two harvests.
pub const MAX_PENDING_TRANSACTIONS: usize = 10_000;

/// Running count/sum/min/max of one metric name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricAggregate {
    pub count: i64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricAggregate {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Everything collected since the previous harvest.
#[derive(Debug, Default)]
pub struct Harvest {
    pub transactions: VecDeque<TransactionRecord>,
    pub metrics: HashMap<String, MetricAggregate>,
}

impl Harvest {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.metrics.is_empty()
    }
}

#[derive(Debug)]
pub struct HarvestBuffer {
    pending: Mutex<Harvest>,
    max_transactions: usize,
}

impl Default for HarvestBuffer {
    fn default() -> Self {
        Self::new(MAX_PENDING_TRANSACTIONS)
    }
}

impl HarvestBuffer {
    #[must_use]
    pub fn new(max_transactions: usize) -> Self {
        Self {
            pending: Mutex::new(Harvest::default()),
            max_transactions: max_transactions.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Harvest> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_transaction(&self, record: TransactionRecord) {
        let mut pending = self.lock();
        if pending.transactions.len() >= self.max_transactions {
            if let Some(dropped) = pending.transactions.pop_front() {
                warn!(
                    "Pending transaction queue is full ({}), dropping oldest transaction {}",
                    self.max_transactions, dropped.trace_id
                );
            }
        }
        pending.transactions.push_back(record);
    }

    /// Folds one sample into the aggregate for `name`. Non-finite samples
    /// are ignored.
    pub fn record_metric(&self, name: &str, value: f64) {
        if !value.is_finite() {
            debug!("Ignoring non-finite sample {value} for metric {name}");
            return;
        }
        let mut pending = self.lock();
        match pending.metrics.get_mut(name) {
            Some(aggregate) => aggregate.add(value),
            None => {
                pending
                    .metrics
                    .insert(name.to_string(), MetricAggregate::new(value));
            }
        }
    }

    /// Swaps out the pending harvest for an empty one.
    #[must_use]
    pub fn take(&self) -> Harvest {
        mem::take(&mut *self.lock())
    }

    #[must_use]
    pub fn pending_transactions(&self) -> usize {
        self.lock().transactions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
