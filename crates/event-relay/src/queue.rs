// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded holding area for events awaiting batching.
//!
//! One queue instance backs each lane. Multiple producers enqueue
//! concurrently; a single consumer (the lane's batcher) drains with
//! [`EventQueue::dequeue_batch`]. What happens when the queue is full is a
//! policy decision owned by the producer-facing configuration:
//!
//! - `reject` (default): the producer gets [`QueueError::Full`] and decides
//!   locally whether to drop, log, or back off.
//! - `drop_oldest`: the oldest event is evicted to make room, FIFO, and the
//!   displaced event is reported back so the pipeline can account for it.
//! - `block`: producers use [`EventQueue::enqueue_wait`] and wait for space
//!   up to a bounded timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Duration, Instant};

use crate::config::QueueFullPolicy;
use crate::event::Event;

/// Producer-visible queue errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("event queue is full")]
    Full,

    #[error("event queue is closed")]
    Closed,
}

/// What `enqueue` did with the event.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Stored without side effects.
    Stored,
    /// Stored, but the queue was full and this older event was evicted.
    Displaced(Event),
}

/// Bounded MPSC event buffer.
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    capacity: usize,
    policy: QueueFullPolicy,
    not_empty: Notify,
    space: Notify,
    closed: AtomicBool,
}

impl EventQueue {
    #[must_use]
    pub fn new(capacity: usize, policy: QueueFullPolicy) -> Self {
        EventQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            policy,
            not_empty: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Appends an event without waiting.
    ///
    /// Under the `block` policy a full queue still returns
    /// [`QueueError::Full`]; callers that want to wait use
    /// [`EventQueue::enqueue_wait`].
    pub fn enqueue(&self, event: Event) -> Result<EnqueueOutcome, QueueError> {
        self.try_push(event).map_err(|rejected| rejected.error)
    }

    // Like enqueue, but hands the event back on failure so enqueue_wait can
    // retry with the same event.
    fn try_push(&self, event: Event) -> Result<EnqueueOutcome, Rejected> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Rejected {
                error: QueueError::Closed,
                event,
            });
        }

        let outcome = {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.len() < self.capacity {
                inner.push_back(event);
                EnqueueOutcome::Stored
            } else {
                match self.policy {
                    QueueFullPolicy::Reject | QueueFullPolicy::Block => {
                        return Err(Rejected {
                            error: QueueError::Full,
                            event,
                        });
                    }
                    QueueFullPolicy::DropOldest => {
                        // capacity is validated > 0, so the front exists
                        let displaced = inner.pop_front();
                        inner.push_back(event);
                        match displaced {
                            Some(old) => EnqueueOutcome::Displaced(old),
                            None => EnqueueOutcome::Stored,
                        }
                    }
                }
            }
        };

        self.not_empty.notify_one();
        Ok(outcome)
    }

    /// Appends an event, waiting up to `max_wait` for space (`block` policy).
    pub async fn enqueue_wait(
        &self,
        event: Event,
        max_wait: Duration,
    ) -> Result<EnqueueOutcome, QueueError> {
        let deadline = Instant::now() + max_wait;
        let mut pending = event;
        loop {
            let notified = self.space.notified();
            match self.try_push(pending) {
                Ok(outcome) => return Ok(outcome),
                Err(rejected) => {
                    if rejected.error == QueueError::Closed {
                        return Err(QueueError::Closed);
                    }
                    pending = rejected.event;
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                // a wakeup between the failed push and the first poll of
                // `notified` can be missed; re-check before giving up
                return match self.try_push(pending) {
                    Ok(outcome) => Ok(outcome),
                    Err(rejected) => Err(rejected.error),
                };
            }
        }
    }

    /// Removes up to `max_n` events, waiting at most `max_wait` for the first
    /// one. Returns an empty vector on timeout or when the queue is closed
    /// and empty. Never blocks indefinitely.
    pub async fn dequeue_batch(&self, max_n: usize, max_wait: Duration) -> Vec<Event> {
        if max_n == 0 {
            return Vec::new();
        }
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.not_empty.notified();
            {
                #[allow(clippy::expect_used)]
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if !inner.is_empty() {
                    let take = inner.len().min(max_n);
                    let drained: Vec<Event> = inner.drain(..take).collect();
                    drop(inner);
                    self.space.notify_waiters();
                    return drained;
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return Vec::new();
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Empties the queue synchronously. Used by the batcher during shutdown
    /// drain, after producers have been stopped.
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let drained: Vec<Event> = inner.drain(..).collect();
        drop(inner);
        self.space.notify_waiters();
        drained
    }

    /// Stops producers. Subsequent `enqueue` calls fail with
    /// [`QueueError::Closed`]; waiters are woken.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.space.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current number of buffered events.
    #[must_use]
    pub fn depth(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("queue lock poisoned").len()
    }
}

struct Rejected {
    error: QueueError,
    event: Event,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::{LogEvent, LogLevel};

    fn log_event(message: &str) -> Event {
        Event::Log(LogEvent {
            timestamp_ms: 1,
            level: LogLevel::Information,
            message: message.to_string(),
            fields: Vec::new(),
            trace_id: None,
            span_id: None,
            service: "test".to_string(),
        })
    }

    fn message_of(event: &Event) -> &str {
        match event {
            Event::Log(log) => &log.message,
            Event::Span(_) => panic!("expected log event"),
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_preserves_order() {
        let queue = EventQueue::new(8, QueueFullPolicy::Reject);
        for i in 0..3 {
            queue.enqueue(log_event(&format!("m{i}"))).unwrap();
        }

        let events = queue.dequeue_batch(10, Duration::from_millis(10)).await;
        let messages: Vec<&str> = events.iter().map(message_of).collect();
        assert_eq!(messages, vec!["m0", "m1", "m2"]);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn dequeue_respects_max_n() {
        let queue = EventQueue::new(8, QueueFullPolicy::Reject);
        for i in 0..5 {
            queue.enqueue(log_event(&format!("m{i}"))).unwrap();
        }

        let first = queue.dequeue_batch(2, Duration::from_millis(10)).await;
        assert_eq!(first.len(), 2);
        assert_eq!(queue.depth(), 3);

        let rest = queue.dequeue_batch(10, Duration::from_millis(10)).await;
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let queue = EventQueue::new(8, QueueFullPolicy::Reject);
        let events = queue.dequeue_batch(10, Duration::from_millis(20)).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn reject_policy_surfaces_full() {
        let queue = EventQueue::new(2, QueueFullPolicy::Reject);
        queue.enqueue(log_event("a")).unwrap();
        queue.enqueue(log_event("b")).unwrap();

        let err = queue.enqueue(log_event("c")).unwrap_err();
        assert_eq!(err, QueueError::Full);
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn drop_oldest_policy_evicts_front() {
        let queue = EventQueue::new(2, QueueFullPolicy::DropOldest);
        queue.enqueue(log_event("a")).unwrap();
        queue.enqueue(log_event("b")).unwrap();

        match queue.enqueue(log_event("c")).unwrap() {
            EnqueueOutcome::Displaced(old) => assert_eq!(message_of(&old), "a"),
            EnqueueOutcome::Stored => panic!("expected displacement"),
        }

        let events = queue.dequeue_batch(10, Duration::from_millis(10)).await;
        let messages: Vec<&str> = events.iter().map(message_of).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn enqueue_wait_succeeds_once_space_frees_up() {
        let queue = std::sync::Arc::new(EventQueue::new(1, QueueFullPolicy::Block));
        queue.enqueue(log_event("a")).unwrap();

        let q = std::sync::Arc::clone(&queue);
        let waiter = tokio::spawn(async move {
            q.enqueue_wait(log_event("b"), Duration::from_secs(1)).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let drained = queue.dequeue_batch(1, Duration::from_millis(10)).await;
        assert_eq!(drained.len(), 1);

        waiter.await.unwrap().unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn enqueue_wait_times_out_when_no_space() {
        let queue = EventQueue::new(1, QueueFullPolicy::Block);
        queue.enqueue(log_event("a")).unwrap();

        let err = queue
            .enqueue_wait(log_event("b"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Full);
    }

    #[tokio::test]
    async fn closed_queue_rejects_producers_and_drains_consumers() {
        let queue = EventQueue::new(8, QueueFullPolicy::Reject);
        queue.enqueue(log_event("a")).unwrap();
        queue.close();

        assert_eq!(queue.enqueue(log_event("b")).unwrap_err(), QueueError::Closed);

        // buffered events remain readable after close
        let events = queue.dequeue_batch(10, Duration::from_millis(10)).await;
        assert_eq!(events.len(), 1);

        let empty = queue.dequeue_batch(10, Duration::from_millis(10)).await;
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn concurrent_producers_all_land() {
        let queue = std::sync::Arc::new(EventQueue::new(1024, QueueFullPolicy::Reject));
        let mut tasks = Vec::new();
        for p in 0..8 {
            let q = std::sync::Arc::clone(&queue);
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    q.enqueue(log_event(&format!("p{p}-{i}"))).unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(queue.depth(), 400);
    }
}
