// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery manager.
//!
//! Batches enter through a router that fans each one out to every backend
//! registered for its lane. Each backend runs an independent dispatcher, a
//! `JoinSet`-capped worker pool driving the per-batch state machine:
//!
//! ```text
//! Pending -> Sending -> Delivered
//!               |-> Retrying -> Sending (backoff with jitter)
//!               |-> DeadLettered (permanent / retries exhausted / aborted)
//!               '-> Spillover (breaker open) -> Sending (breaker closed)
//! ```
//!
//! Failures on one backend never affect another: retries, breaker state and
//! spillover are all per backend. Delivery is at-least-once; nothing here
//! suppresses duplicates.

pub mod circuit_breaker;
pub mod dead_letter;
pub mod retry;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use dead_letter::{DeadLetterReason, DeadLetterRecord, DeadLetterStore};
pub use retry::RetryPolicy;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backends::{BackendAdapter, SendError};
use crate::batcher::Batch;
use crate::config::PipelineConfig;
use crate::event::Lane;
use crate::stats::{FlushTracker, PipelineStats};

/// Outcome of one send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// Record of one send attempt, kept for observability on failing batches.
#[derive(Clone, Copy, Debug)]
pub struct DeliveryAttempt {
    pub batch_id: u64,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub next_retry_at: Option<Instant>,
}

// Attempt history is observability data, not control state; cap it so a
// long-failing batch cannot grow its record without bound.
const MAX_RECORDED_ATTEMPTS: usize = 16;
const CHANNEL_CAPACITY: usize = 16;
const SPILLOVER_POLL: Duration = Duration::from_millis(250);

/// Drops to `complete` its events on the flush tracker once every backend
/// of the lane has settled the batch, whatever path got it there.
pub(crate) struct SettleGuard {
    events: u64,
    flush: Arc<FlushTracker>,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.flush.complete(self.events);
    }
}

/// A batch owned by one backend's dispatcher, with its attempt history.
pub(crate) struct TrackedBatch {
    batch: Arc<Batch>,
    attempt_count: u32,
    attempts: Vec<DeliveryAttempt>,
    _settle: Arc<SettleGuard>,
}

/// Per-backend view handed back to the pipeline for stats.
pub(crate) struct BackendHandle {
    pub(crate) name: String,
    pub(crate) breaker: Arc<CircuitBreaker>,
}

/// Spawns the router and one dispatcher per backend. Returns the batch
/// intake used by the batchers, the task handles, and the stats handles.
pub(crate) fn spawn(
    backends: Vec<Arc<dyn BackendAdapter>>,
    config: &PipelineConfig,
    stats: Arc<PipelineStats>,
    dead_letters: Arc<DeadLetterStore>,
    flush: Arc<FlushTracker>,
    force: CancellationToken,
) -> (mpsc::Sender<Batch>, Vec<JoinHandle<()>>, Vec<BackendHandle>) {
    let (batch_tx, batch_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut tasks = Vec::new();
    let mut outputs = Vec::new();
    let mut handles = Vec::new();

    for adapter in backends {
        let name = adapter.name().to_string();
        let lane = adapter.lane();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), config.breaker));
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        handles.push(BackendHandle {
            name,
            breaker: Arc::clone(&breaker),
        });
        outputs.push(LaneOutput { lane, tx });

        let dispatcher = Arc::new(Dispatcher {
            adapter,
            breaker,
            retry: RetryPolicy::new(config.retry),
            max_in_flight: config.max_in_flight_per_backend,
            spillover_capacity: config.spillover_capacity,
            stats: Arc::clone(&stats),
            dead_letters: Arc::clone(&dead_letters),
            force: force.clone(),
        });
        tasks.push(tokio::spawn(dispatcher.run(rx)));
    }

    tasks.push(tokio::spawn(route(batch_rx, outputs, stats, flush)));
    (batch_tx, tasks, handles)
}

struct LaneOutput {
    lane: Lane,
    tx: mpsc::Sender<TrackedBatch>,
}

/// Fans incoming batches out to every backend of their lane, in creation
/// order. A lane with no backend drops its batches here (counted, never
/// buffered forever).
async fn route(
    mut rx: mpsc::Receiver<Batch>,
    outputs: Vec<LaneOutput>,
    stats: Arc<PipelineStats>,
    flush: Arc<FlushTracker>,
) {
    while let Some(batch) = rx.recv().await {
        stats.record_batch_created();
        let events = batch.len() as u64;
        let lane = batch.lane;

        let targets: Vec<&LaneOutput> = outputs.iter().filter(|o| o.lane == lane).collect();
        if targets.is_empty() {
            debug!(lane = %lane, events, "no backend configured for lane, dropping batch");
            stats.record_dropped(events);
            flush.complete(events);
            continue;
        }

        let batch = Arc::new(batch);
        let settle = Arc::new(SettleGuard {
            events,
            flush: Arc::clone(&flush),
        });
        for target in targets {
            let tracked = TrackedBatch {
                batch: Arc::clone(&batch),
                attempt_count: 0,
                attempts: Vec::new(),
                _settle: Arc::clone(&settle),
            };
            if target.tx.send(tracked).await.is_err() {
                debug!(lane = %lane, "dispatcher gone, dropping batch copy");
            }
        }
    }
    debug!("delivery router stopped");
}

struct Dispatcher {
    adapter: Arc<dyn BackendAdapter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    max_in_flight: usize,
    spillover_capacity: usize,
    stats: Arc<PipelineStats>,
    dead_letters: Arc<DeadLetterStore>,
    force: CancellationToken,
}

impl Dispatcher {
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<TrackedBatch>) {
        let mut in_flight: JoinSet<Option<TrackedBatch>> = JoinSet::new();
        let mut spillover: VecDeque<TrackedBatch> = VecDeque::new();
        let mut poll = interval(SPILLOVER_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // replay parked batches while the breaker admits sends
            while in_flight.len() < self.max_in_flight
                && !spillover.is_empty()
                && self.breaker.ready()
            {
                if let Some(tracked) = spillover.pop_front() {
                    let this = Arc::clone(&self);
                    in_flight.spawn(async move { this.deliver(tracked).await });
                }
            }

            tokio::select! {
                maybe = rx.recv(), if in_flight.len() < self.max_in_flight => {
                    match maybe {
                        Some(tracked) => {
                            let this = Arc::clone(&self);
                            in_flight.spawn(async move { this.deliver(tracked).await });
                        }
                        None => break,
                    }
                }
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.settle_join(result, &mut spillover);
                }
                _ = poll.tick(), if !spillover.is_empty() => {}
            }
        }

        // intake closed: let in-flight sends finish
        while let Some(result) = in_flight.join_next().await {
            self.settle_join(result, &mut spillover);
        }

        // parked batches get a final chance while the breaker allows it;
        // once the grace period forces cancellation they dead-letter
        while let Some(tracked) = spillover.pop_front() {
            if self.force.is_cancelled() {
                self.dead_letter(tracked, DeadLetterReason::ShutdownAborted);
                continue;
            }
            if self.breaker.ready() {
                if let Some(rejected) = self.deliver(tracked).await {
                    spillover.push_front(rejected);
                    self.pause_for_breaker().await;
                }
            } else {
                spillover.push_front(tracked);
                self.pause_for_breaker().await;
            }
        }

        debug!(backend = self.adapter.name(), "dispatcher stopped");
    }

    async fn pause_for_breaker(&self) {
        tokio::select! {
            () = self.force.cancelled() => {}
            () = sleep(SPILLOVER_POLL) => {}
        }
    }

    fn settle_join(
        &self,
        result: Result<Option<TrackedBatch>, JoinError>,
        spillover: &mut VecDeque<TrackedBatch>,
    ) {
        match result {
            Ok(Some(tracked)) => {
                if spillover.len() >= self.spillover_capacity {
                    self.dead_letter(tracked, DeadLetterReason::SpilloverOverflow);
                } else {
                    spillover.push_back(tracked);
                }
            }
            Ok(None) => {}
            // the settle guard already accounted for the batch on drop
            Err(e) => error!(backend = self.adapter.name(), "delivery task failed: {e}"),
        }
    }

    /// Drives one batch to a terminal state. Returns the batch back when the
    /// breaker refuses it, so the dispatcher can park it.
    async fn deliver(&self, mut tracked: TrackedBatch) -> Option<TrackedBatch> {
        let payload = match self.adapter.serialize(&tracked.batch) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    backend = self.adapter.name(),
                    batch_id = tracked.batch.id,
                    "failed to serialize batch: {e}"
                );
                self.dead_letter(tracked, DeadLetterReason::PermanentFailure);
                return None;
            }
        };

        loop {
            if !self.breaker.try_acquire() {
                return Some(tracked);
            }

            let result = tokio::select! {
                result = self.adapter.send(&payload) => result,
                () = self.force.cancelled() => {
                    self.dead_letter(tracked, DeadLetterReason::ShutdownAborted);
                    return None;
                }
            };
            tracked.attempt_count += 1;
            let attempt = tracked.attempt_count;

            match result {
                Ok(()) => {
                    self.breaker.on_success();
                    self.stats.record_delivered(tracked.batch.len() as u64);
                    debug!(
                        backend = self.adapter.name(),
                        batch_id = tracked.batch.id,
                        events = tracked.batch.len(),
                        attempt,
                        "batch delivered"
                    );
                    return None;
                }
                Err(SendError::Permanent(message)) => {
                    error!(
                        backend = self.adapter.name(),
                        batch_id = tracked.batch.id,
                        "permanent send failure: {message}"
                    );
                    self.record_attempt(&mut tracked, AttemptOutcome::PermanentFailure, None);
                    self.dead_letter(tracked, DeadLetterReason::PermanentFailure);
                    return None;
                }
                Err(SendError::Transient(message)) => {
                    self.breaker.on_transient_failure();
                    if attempt >= self.retry.max_attempts() {
                        warn!(
                            backend = self.adapter.name(),
                            batch_id = tracked.batch.id,
                            attempts = attempt,
                            "retries exhausted: {message}"
                        );
                        self.record_attempt(&mut tracked, AttemptOutcome::TransientFailure, None);
                        self.dead_letter(tracked, DeadLetterReason::RetriesExhausted);
                        return None;
                    }
                    let delay = self.retry.delay_after(attempt);
                    self.record_attempt(
                        &mut tracked,
                        AttemptOutcome::TransientFailure,
                        Some(Instant::now() + delay),
                    );
                    warn!(
                        backend = self.adapter.name(),
                        batch_id = tracked.batch.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient send failure, will retry: {message}"
                    );
                    tokio::select! {
                        () = sleep(delay) => {}
                        () = self.force.cancelled() => {
                            self.dead_letter(tracked, DeadLetterReason::ShutdownAborted);
                            return None;
                        }
                    }
                }
            }
        }
    }

    fn record_attempt(
        &self,
        tracked: &mut TrackedBatch,
        outcome: AttemptOutcome,
        next_retry_at: Option<Instant>,
    ) {
        if tracked.attempts.len() < MAX_RECORDED_ATTEMPTS {
            tracked.attempts.push(DeliveryAttempt {
                batch_id: tracked.batch.id,
                attempt_number: tracked.attempt_count,
                outcome,
                next_retry_at,
            });
        }
    }

    fn dead_letter(&self, tracked: TrackedBatch, reason: DeadLetterReason) {
        self.stats.record_dead_lettered(tracked.batch.len() as u64);
        self.dead_letters.push(DeadLetterRecord {
            batch: tracked.batch,
            backend: self.adapter.name().to_string(),
            attempts: tracked.attempts,
            reason,
        });
    }
}
