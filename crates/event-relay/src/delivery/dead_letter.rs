// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Terminal storage for undeliverable batches.
//!
//! A batch lands here with its attempt history when retries are exhausted,
//! when a backend answers with a non-retryable error, or when shutdown runs
//! out of grace. Records are never auto-deleted; an operator (or a test)
//! drains them explicitly with [`DeadLetterStore::drain`]. The store is
//! bounded: under sustained failure the oldest records are evicted and
//! counted rather than growing without limit.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::batcher::Batch;
use crate::delivery::DeliveryAttempt;

/// Why a batch was dead-lettered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Transient failures up to the configured attempt limit.
    RetriesExhausted,
    /// Non-retryable response or unserializable batch.
    PermanentFailure,
    /// The breaker-open spillover queue was full.
    SpilloverOverflow,
    /// Shutdown grace expired with the batch still unsettled.
    ShutdownAborted,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::RetriesExhausted => f.write_str("retries exhausted"),
            DeadLetterReason::PermanentFailure => f.write_str("permanent failure"),
            DeadLetterReason::SpilloverOverflow => f.write_str("spillover overflow"),
            DeadLetterReason::ShutdownAborted => f.write_str("shutdown aborted"),
        }
    }
}

/// A dead batch with its delivery history.
#[derive(Debug)]
pub struct DeadLetterRecord {
    pub batch: Arc<Batch>,
    pub backend: String,
    pub attempts: Vec<DeliveryAttempt>,
    pub reason: DeadLetterReason,
}

/// Bounded in-memory dead letter store.
#[derive(Debug)]
pub struct DeadLetterStore {
    capacity: usize,
    inner: Mutex<VecDeque<DeadLetterRecord>>,
    evicted: AtomicU64,
}

impl DeadLetterStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        DeadLetterStore {
            capacity,
            inner: Mutex::new(VecDeque::new()),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn push(&self, record: DeadLetterRecord) {
        warn!(
            backend = %record.backend,
            batch_id = record.batch.id,
            events = record.batch.len(),
            reason = %record.reason,
            "batch dead-lettered"
        );
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("dead letter lock poisoned");
        if inner.len() >= self.capacity {
            inner.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
            warn!("dead letter store full, evicting oldest record");
        }
        inner.push_back(record);
    }

    /// Removes and returns every record. Operator action / test hook.
    #[must_use]
    pub fn drain(&self) -> Vec<DeadLetterRecord> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("dead letter lock poisoned");
        inner.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("dead letter lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records evicted because the store itself overflowed.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
