// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-observability for the pipeline.
//!
//! The pipeline that ships everyone else's telemetry still needs to answer
//! for itself. Counters are plain atomics, snapshotted on demand through
//! [`crate::pipeline::Pipeline::stats`]; nothing here pushes anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tokio::time::{timeout_at, Duration, Instant};

use crate::delivery::BreakerState;

/// Monotonic pipeline counters.
///
/// `events_delivered` / `events_dead_lettered` count per backend delivery:
/// one batch shipped to two backends moves the counters twice.
#[derive(Debug, Default)]
pub struct PipelineStats {
    events_enqueued: AtomicU64,
    events_dropped: AtomicU64,
    events_delivered: AtomicU64,
    events_dead_lettered: AtomicU64,
    batches_created: AtomicU64,
    batches_delivered: AtomicU64,
    batches_dead_lettered: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn record_enqueued(&self) {
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, events: u64) {
        self.events_dropped.fetch_add(events, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_created(&self) {
        self.batches_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self, events: u64) {
        self.events_delivered.fetch_add(events, Ordering::Relaxed);
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self, events: u64) {
        self.events_dead_lettered.fetch_add(events, Ordering::Relaxed);
        self.batches_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the pipeline's own health.
#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    pub events_enqueued: u64,
    pub events_dropped: u64,
    pub events_delivered: u64,
    pub events_dead_lettered: u64,
    pub batches_created: u64,
    pub batches_delivered: u64,
    pub batches_dead_lettered: u64,
    pub logs_queue_depth: usize,
    pub spans_queue_depth: usize,
    pub dead_letter_batches: usize,
    pub breakers: Vec<BackendBreaker>,
}

/// Breaker state of one configured backend.
#[derive(Clone, Debug)]
pub struct BackendBreaker {
    pub backend: String,
    pub state: BreakerState,
}

impl PipelineStats {
    pub(crate) fn counters(&self) -> (u64, u64, u64, u64, u64, u64, u64) {
        (
            self.events_enqueued.load(Ordering::Relaxed),
            self.events_dropped.load(Ordering::Relaxed),
            self.events_delivered.load(Ordering::Relaxed),
            self.events_dead_lettered.load(Ordering::Relaxed),
            self.batches_created.load(Ordering::Relaxed),
            self.batches_delivered.load(Ordering::Relaxed),
            self.batches_dead_lettered.load(Ordering::Relaxed),
        )
    }
}

/// Tracks how many accepted events have not yet reached a terminal state.
///
/// `begin` on enqueue, `complete` when an event is dropped or when its batch
/// settles on every backend of its lane. `flush` and `shutdown` wait on the
/// count reaching zero.
#[derive(Debug, Default)]
pub(crate) struct FlushTracker {
    outstanding: AtomicU64,
    notify: Notify,
}

impl FlushTracker {
    pub(crate) fn begin(&self, events: u64) {
        self.outstanding.fetch_add(events, Ordering::AcqRel);
    }

    pub(crate) fn complete(&self, events: u64) {
        if events == 0 {
            return;
        }
        let previous = self.outstanding.fetch_sub(events, Ordering::AcqRel);
        if previous <= events {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Waits until nothing is outstanding or the deadline passes. Returns
    /// the number still outstanding on timeout.
    pub(crate) async fn wait_empty(&self, max_wait: Duration) -> Result<(), u64> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            let outstanding = self.outstanding();
            if outstanding == 0 {
                return Ok(());
            }
            if timeout_at(deadline, notified).await.is_err() {
                let outstanding = self.outstanding();
                if outstanding == 0 {
                    return Ok(());
                }
                return Err(outstanding);
            }
        }
    }
}
