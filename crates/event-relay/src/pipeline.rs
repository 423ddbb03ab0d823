// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The pipeline façade.
//!
//! A [`Pipeline`] is constructed once by the process composition root and
//! passed by reference to producers; there is no global instance. Producers
//! call [`Pipeline::emit`]; everything downstream (batching, delivery,
//! retries, dead-lettering) is asynchronous and internal, so the only
//! failure a producer ever sees is its lane's queue being full.
//!
//! Delivery is at-least-once per configured backend. Duplicate suppression
//! is deliberately not provided: a batch that fails mid-send may be shipped
//! again. Elasticsearch callers can deduplicate with deterministic document
//! ids; Loki and OTLP callers must tolerate occasional duplicates.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backends::{BackendAdapter, ElasticsearchBulk, LokiPush, OtlpTrace};
use crate::batcher::Batcher;
use crate::config::{ConfigError, PipelineConfig, QueueFullPolicy};
use crate::delivery::{self, BackendHandle, DeadLetterStore};
use crate::event::{Event, Lane};
use crate::queue::{EnqueueOutcome, EventQueue, QueueError};
use crate::stats::{BackendBreaker, FlushTracker, PipelineStats, StatsSnapshot};

/// Error returned by [`Pipeline::flush`] when the deadline passes first.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlushError {
    #[error("flush timed out with {outstanding} events still in flight")]
    Timeout { outstanding: u64 },
}

/// Structured observability event pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    log_queue: Arc<EventQueue>,
    span_queue: Arc<EventQueue>,
    stats: Arc<PipelineStats>,
    dead_letters: Arc<DeadLetterStore>,
    flush: Arc<FlushTracker>,
    log_flush_signal: Arc<Notify>,
    span_flush_signal: Arc<Notify>,
    shutdown: CancellationToken,
    force: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    backend_handles: Vec<BackendHandle>,
}

impl Pipeline {
    /// Validates the configuration, builds the configured backend adapters
    /// and starts the pipeline tasks. Must be called within a tokio runtime.
    pub fn start(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut backends: Vec<Arc<dyn BackendAdapter>> = Vec::new();
        if let Some(es) = &config.elasticsearch {
            backends.push(Arc::new(ElasticsearchBulk::new(es, config.request_timeout)));
        }
        if let Some(loki) = &config.loki {
            backends.push(Arc::new(LokiPush::new(loki, config.request_timeout)));
        }
        if let Some(otlp) = &config.otlp {
            backends.push(Arc::new(OtlpTrace::new(otlp, config.request_timeout)));
        }
        Self::start_with_backends(config, backends)
    }

    /// Like [`Pipeline::start`] but with caller-provided adapters. This is
    /// the seam tests and embedders with custom backends use.
    pub fn start_with_backends(
        config: PipelineConfig,
        backends: Vec<Arc<dyn BackendAdapter>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let stats = Arc::new(PipelineStats::default());
        let dead_letters = Arc::new(DeadLetterStore::new(config.dead_letter_capacity));
        let flush = Arc::new(FlushTracker::default());
        let shutdown = CancellationToken::new();
        let force = CancellationToken::new();

        let backend_count = backends.len();
        let (batch_tx, mut tasks, backend_handles) = delivery::spawn(
            backends,
            &config,
            Arc::clone(&stats),
            Arc::clone(&dead_letters),
            Arc::clone(&flush),
            force.clone(),
        );

        let log_queue = Arc::new(EventQueue::new(
            config.queue_capacity,
            config.queue_full_policy,
        ));
        let span_queue = Arc::new(EventQueue::new(
            config.queue_capacity,
            config.queue_full_policy,
        ));
        let log_flush_signal = Arc::new(Notify::new());
        let span_flush_signal = Arc::new(Notify::new());
        let batch_ids = Arc::new(AtomicU64::new(0));

        let lanes = [
            (
                Lane::Logs,
                Arc::clone(&log_queue),
                config.log_batch,
                Arc::clone(&log_flush_signal),
            ),
            (
                Lane::Spans,
                Arc::clone(&span_queue),
                config.span_batch,
                Arc::clone(&span_flush_signal),
            ),
        ];
        for (lane, queue, batch_config, flush_signal) in lanes {
            let batcher = Batcher::new(
                lane,
                queue,
                batch_config,
                batch_tx.clone(),
                shutdown.clone(),
                flush_signal,
                Arc::clone(&batch_ids),
            );
            tasks.push(tokio::spawn(batcher.run()));
        }
        // the batchers hold the only senders now; the router stops once
        // both lanes have drained during shutdown
        drop(batch_tx);

        info!(backends = backend_count, "event pipeline started");

        Ok(Pipeline {
            config,
            log_queue,
            span_queue,
            stats,
            dead_letters,
            flush,
            log_flush_signal,
            span_flush_signal,
            shutdown,
            force,
            tasks,
            backend_handles,
        })
    }

    /// Accepts an event into its lane.
    ///
    /// Fast and non-blocking under the `reject` and `drop_oldest` policies;
    /// waits up to `block_timeout` for space under `block`. The only errors
    /// are the lane being full or the pipeline shutting down; all delivery
    /// failures are asynchronous and internal.
    pub async fn emit(&self, event: Event) -> Result<(), QueueError> {
        let queue = match event.lane() {
            Lane::Logs => &self.log_queue,
            Lane::Spans => &self.span_queue,
        };

        // account before enqueue: a fast batcher may settle the event before
        // this call returns
        self.flush.begin(1);
        let result = match self.config.queue_full_policy {
            QueueFullPolicy::Block => queue.enqueue_wait(event, self.config.block_timeout).await,
            QueueFullPolicy::Reject | QueueFullPolicy::DropOldest => queue.enqueue(event),
        };

        match result {
            Ok(EnqueueOutcome::Stored) => {
                self.stats.record_enqueued();
                Ok(())
            }
            Ok(EnqueueOutcome::Displaced(_old)) => {
                self.stats.record_enqueued();
                self.stats.record_dropped(1);
                self.flush.complete(1);
                Ok(())
            }
            Err(e) => {
                self.flush.complete(1);
                Err(e)
            }
        }
    }

    /// Closes partial batches immediately and waits until every event
    /// accepted so far is terminal (delivered or dead-lettered on every
    /// backend of its lane) or the deadline passes.
    pub async fn flush(&self, max_wait: Duration) -> Result<(), FlushError> {
        debug!("flush requested");
        self.log_flush_signal.notify_one();
        self.span_flush_signal.notify_one();
        self.flush
            .wait_empty(max_wait)
            .await
            .map_err(|outstanding| FlushError::Timeout { outstanding })
    }

    /// Stops intake, drains both lanes into final batches, then waits up to
    /// the configured grace period for delivery to settle. Whatever is still
    /// unsettled when the grace expires is forcibly dead-lettered: logged,
    /// never silently lost.
    pub async fn shutdown(mut self) {
        info!("pipeline shutting down");
        self.log_queue.close();
        self.span_queue.close();
        self.shutdown.cancel();

        match self.flush.wait_empty(self.config.shutdown_grace).await {
            Ok(()) => debug!("all events settled within the grace period"),
            Err(outstanding) => {
                warn!(
                    outstanding,
                    "shutdown grace exceeded, dead-lettering remaining batches"
                );
                self.force.cancel();
            }
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("pipeline task failed during shutdown: {e}");
            }
        }
        info!("pipeline stopped");
    }

    /// Point-in-time operational snapshot of the pipeline itself.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let (
            events_enqueued,
            events_dropped,
            events_delivered,
            events_dead_lettered,
            batches_created,
            batches_delivered,
            batches_dead_lettered,
        ) = self.stats.counters();
        StatsSnapshot {
            events_enqueued,
            events_dropped,
            events_delivered,
            events_dead_lettered,
            batches_created,
            batches_delivered,
            batches_dead_lettered,
            logs_queue_depth: self.log_queue.depth(),
            spans_queue_depth: self.span_queue.depth(),
            dead_letter_batches: self.dead_letters.len(),
            breakers: self
                .backend_handles
                .iter()
                .map(|handle| BackendBreaker {
                    backend: handle.name.clone(),
                    state: handle.breaker.state(),
                })
                .collect(),
        }
    }

    /// The dead letter store, for operator drains and tests.
    #[must_use]
    pub fn dead_letters(&self) -> Arc<DeadLetterStore> {
        Arc::clone(&self.dead_letters)
    }
}
