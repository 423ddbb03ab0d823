// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Demo composition root for the event pipeline.
//!
//! Builds a [`Pipeline`] from `RELAY_*` environment variables, then runs a
//! supervised emitter that produces a synthetic burst of log events (one per
//! severity) plus a span on a timer, until ctrl-c. The emitter is restarted
//! a bounded number of times if it ever fails; it is not an unbounded
//! retry loop.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use event_relay::{
    Event, LogEvent, LogLevel, Pipeline, PipelineConfig, SpanEvent, SpanId, SpanStatus, TraceId,
};

const EMIT_INTERVAL: Duration = Duration::from_secs(1);
const MAX_EMITTER_RESTARTS: u32 = 3;
const FLUSH_ON_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let log_level = env::var("RELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(format!(
        "event_relay={log_level},event_relay_demo={log_level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return;
        }
    };
    if config.elasticsearch.is_none() && config.loki.is_none() && config.otlp.is_none() {
        warn!(
            "no backend configured; set RELAY_ELASTIC_URL, RELAY_LOKI_URL and/or RELAY_OTLP_URL"
        );
    }
    let service = config.service_name.clone();

    let pipeline = match Pipeline::start(config) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            error!("failed to start pipeline: {e}");
            return;
        }
    };

    let cancel = CancellationToken::new();
    let emitter = tokio::spawn(supervise_emitter(
        Arc::clone(&pipeline),
        service,
        cancel.clone(),
    ));

    info!("demo emitter running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
    }
    info!("shutting down");

    cancel.cancel();
    let _ = emitter.await;

    if let Err(e) = pipeline.flush(FLUSH_ON_EXIT_TIMEOUT).await {
        warn!("final flush incomplete: {e}");
    }
    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown().await,
        Err(_) => error!("pipeline still shared at exit, skipping graceful shutdown"),
    }
}

/// Runs the emitter, restarting it a bounded number of times on failure.
async fn supervise_emitter(pipeline: Arc<Pipeline>, service: String, cancel: CancellationToken) {
    let mut restarts = 0;
    loop {
        let task = tokio::spawn(emit_loop(
            Arc::clone(&pipeline),
            service.clone(),
            cancel.clone(),
        ));
        match task.await {
            Ok(()) => break,
            Err(e) => {
                restarts += 1;
                if restarts > MAX_EMITTER_RESTARTS {
                    error!("emitter failed {restarts} times, giving up: {e}");
                    break;
                }
                warn!("emitter failed, restarting ({restarts}/{MAX_EMITTER_RESTARTS}): {e}");
            }
        }
        if cancel.is_cancelled() {
            break;
        }
    }
}

async fn emit_loop(pipeline: Arc<Pipeline>, service: String, cancel: CancellationToken) {
    let mut tick = interval(EMIT_INTERVAL);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => emit_burst(&pipeline, &service).await,
        }
    }
}

/// One synthetic request: a log line per severity, correlated to one span.
async fn emit_burst(pipeline: &Pipeline, service: &str) {
    let trace_id = TraceId::from_u128(rand::random());
    let span_id = SpanId::from_u64(rand::random());
    let latency_ms = u64::from(rand::random::<u8>()) + 1;
    let finished = now_ms();
    let started = finished.saturating_sub(latency_ms);

    let levels = [
        (LogLevel::Trace, "entering request handler"),
        (LogLevel::Debug, "resolved downstream endpoint"),
        (LogLevel::Information, "handled synthetic request"),
        (LogLevel::Warning, "response size above soft limit"),
        (LogLevel::Error, "downstream call failed, using fallback"),
        (LogLevel::Critical, "fallback pool nearly exhausted"),
    ];
    for (level, message) in levels {
        let event = Event::Log(LogEvent {
            timestamp_ms: finished,
            level,
            message: message.to_string(),
            fields: vec![("latency_ms".to_string(), serde_json::Value::from(latency_ms))],
            trace_id: Some(trace_id),
            span_id: Some(span_id),
            service: service.to_string(),
        });
        if let Err(e) = pipeline.emit(event).await {
            warn!("dropping demo log event: {e}");
        }
    }

    let span = Event::Span(SpanEvent {
        trace_id,
        span_id,
        parent_span_id: None,
        name: "synthetic-request".to_string(),
        start_time_ms: started,
        end_time_ms: finished,
        status: if latency_ms > 200 {
            SpanStatus::Error
        } else {
            SpanStatus::Ok
        },
        tags: vec![("generator".to_string(), "demo".to_string())],
        service: service.to_string(),
    });
    if let Err(e) = pipeline.emit(span).await {
        warn!("dropping demo span event: {e}");
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
