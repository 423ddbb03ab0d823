// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Event Relay
//!
//! An in-process structured observability event pipeline: application code
//! emits log and span events, the pipeline buffers and batches them per
//! lane, and ships them to one or more telemetry backends with retry,
//! circuit breaking and at-least-once delivery.
//!
//! ## Architecture
//!
//! ```text
//! producers -> Pipeline::emit -> EventQueue (per lane)
//!                                    |
//!                                 Batcher (size-or-age, per lane)
//!                                    |
//!                              delivery router
//!                               /         \
//!                       dispatcher     dispatcher      (per backend:
//!                      elasticsearch      loki          worker pool,
//!                                                       retry, breaker,
//!                                                       spillover)
//!                               \         /
//!                         external sink, or DeadLetterStore
//! ```
//!
//! ## Modules
//!
//! - [`event`]: the event model: log records, spans, lanes
//! - [`queue`]: bounded per-lane buffering with configurable full-queue policy
//! - [`batcher`]: size-or-age batch forming
//! - [`backends`]: the `BackendAdapter` trait and the Elasticsearch bulk,
//!   Loki push and OTLP trace adapters
//! - [`delivery`]: retry with backoff, per-backend circuit breakers,
//!   dead-letter storage
//! - [`pipeline`]: the façade producers talk to
//! - [`config`]: validated immutable configuration
//! - [`stats`]: the pipeline's own counters and snapshot
//!
//! ## Delivery semantics
//!
//! At-least-once per configured backend, never exactly-once: duplicate
//! suppression is out of scope. Pair non-idempotent backends accordingly.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]

/// Backend adapters: Elasticsearch bulk, Loki push, OTLP traces
pub mod backends;

/// Size-or-age batch forming, one lane per event kind
pub mod batcher;

/// Pipeline configuration and validation
pub mod config;

/// Retry, circuit breaking and dead-letter handling
pub mod delivery;

/// The event model
pub mod event;

/// The pipeline façade
pub mod pipeline;

/// Bounded per-lane event buffering
pub mod queue;

/// Pipeline self-observability
pub mod stats;

pub use backends::{BackendAdapter, SendError, SerializeError, WirePayload};
pub use batcher::Batch;
pub use config::{ConfigError, PipelineConfig, QueueFullPolicy};
pub use delivery::{
    AttemptOutcome, BreakerState, DeadLetterReason, DeadLetterRecord, DeliveryAttempt,
};
pub use event::{Event, Lane, LogEvent, LogLevel, SpanEvent, SpanId, SpanStatus, TraceId};
pub use pipeline::{FlushError, Pipeline};
pub use queue::QueueError;
pub use stats::StatsSnapshot;
