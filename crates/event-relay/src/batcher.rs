// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size-or-age batch forming.
//!
//! One batcher task runs per lane. A batch is closed and forwarded when it
//! reaches `max_batch_size` events or when its oldest event reaches
//! `max_batch_age`, whichever comes first. Partial batches are closed
//! immediately on an explicit flush signal and on shutdown; a partial batch
//! is never silently dropped. Insertion order is preserved and lanes are
//! never mixed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::BatchConfig;
use crate::event::{Event, Lane};
use crate::queue::EventQueue;

/// An ordered group of same-lane events shipped in one network call.
#[derive(Clone, Debug)]
pub struct Batch {
    pub id: u64,
    pub lane: Lane,
    pub events: Vec<Event>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub(crate) struct Batcher {
    lane: Lane,
    queue: Arc<EventQueue>,
    config: BatchConfig,
    out: mpsc::Sender<Batch>,
    shutdown: CancellationToken,
    flush_signal: Arc<Notify>,
    batch_ids: Arc<AtomicU64>,
}

impl Batcher {
    pub(crate) fn new(
        lane: Lane,
        queue: Arc<EventQueue>,
        config: BatchConfig,
        out: mpsc::Sender<Batch>,
        shutdown: CancellationToken,
        flush_signal: Arc<Notify>,
        batch_ids: Arc<AtomicU64>,
    ) -> Self {
        Batcher {
            lane,
            queue,
            config,
            out,
            shutdown,
            flush_signal,
            batch_ids,
        }
    }

    /// Runs the lane's batching loop until shutdown, then drains the queue
    /// into final batches.
    pub(crate) async fn run(self) {
        debug!(lane = %self.lane, "batcher started");

        let mut pending: Vec<Event> = Vec::new();
        // set when the first event of the current batch arrives
        let mut deadline: Option<Instant> = None;

        loop {
            let wait = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => self.config.max_batch_age,
            };

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.flush_signal.notified() => {
                    self.close(&mut pending, &mut deadline).await;
                    // pick up whatever is queued right now so a flush does
                    // not have to wait out the age window
                    self.ship_chunked(self.queue.drain()).await;
                }
                events = self.queue.dequeue_batch(
                    self.config.max_batch_size - pending.len(),
                    wait,
                ) => {
                    if pending.is_empty() && !events.is_empty() {
                        deadline = Some(Instant::now() + self.config.max_batch_age);
                    }
                    pending.extend(events);

                    let age_reached = deadline.is_some_and(|d| Instant::now() >= d);
                    if pending.len() >= self.config.max_batch_size
                        || (age_reached && !pending.is_empty())
                    {
                        self.close(&mut pending, &mut deadline).await;
                    }
                }
            }
        }

        // shutdown drain: everything left in the queue goes out in final
        // batches, partial last batch included
        pending.extend(self.queue.drain());
        self.ship_chunked(pending).await;

        debug!(lane = %self.lane, "batcher stopped");
    }

    async fn close(&self, pending: &mut Vec<Event>, deadline: &mut Option<Instant>) {
        *deadline = None;
        if pending.is_empty() {
            return;
        }
        self.ship(std::mem::take(pending)).await;
    }

    async fn ship_chunked(&self, mut events: Vec<Event>) {
        while !events.is_empty() {
            let take = events.len().min(self.config.max_batch_size);
            let chunk: Vec<Event> = events.drain(..take).collect();
            self.ship(chunk).await;
        }
    }

    async fn ship(&self, events: Vec<Event>) {
        let batch = Batch {
            id: self.batch_ids.fetch_add(1, Ordering::Relaxed),
            lane: self.lane,
            events,
        };
        debug!(lane = %self.lane, batch_id = batch.id, events = batch.len(), "closing batch");
        if self.out.send(batch).await.is_err() {
            debug!(lane = %self.lane, "delivery channel closed, dropping batch");
        }
    }
}
