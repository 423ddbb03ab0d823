// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Failure-path tests: retries, permanent errors, circuit breaking and
//! independent per-backend delivery, all against mock HTTP backends.

use std::collections::BTreeMap;
use std::time::Duration;

use mockito::Server;

use event_relay::config::{ElasticsearchConfig, LokiConfig};
use event_relay::{
    BreakerState, DeadLetterReason, Event, LogEvent, LogLevel, Pipeline, PipelineConfig,
};

fn base_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.base_delay = Duration::from_millis(20);
    config.retry.cap = Duration::from_millis(100);
    config.shutdown_grace = Duration::from_millis(500);
    // keep the breaker out of plain retry tests
    config.breaker.threshold = 100;
    config
}

fn log_event(message: &str) -> Event {
    Event::Log(LogEvent {
        timestamp_ms: 1_704_153_599_000,
        level: LogLevel::Error,
        message: message.to_string(),
        fields: Vec::new(),
        trace_id: None,
        span_id: None,
        service: "poc-service".to_string(),
    })
}

#[tokio::test]
async fn server_errors_retry_up_to_the_limit_then_dead_letter() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/_bulk")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let mut config = base_config();
    config.retry.max_attempts = 3;
    config.elasticsearch = Some(ElasticsearchConfig {
        endpoint: server.url(),
        index_prefix: "poc-logs".to_string(),
    });
    let pipeline = Pipeline::start(config).expect("failed to start pipeline");

    pipeline.emit(log_event("doomed")).await.unwrap();
    // dead-lettering is a terminal state, so flush returns cleanly
    pipeline.flush(Duration::from_secs(10)).await.unwrap();

    mock.assert_async().await;

    let records = pipeline.dead_letters().drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(records[0].attempts.len(), 3);

    let snapshot = pipeline.stats();
    assert_eq!(snapshot.events_delivered, 0);
    assert_eq!(snapshot.events_dead_lettered, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn client_errors_dead_letter_without_retry() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/_bulk")
        .with_status(400)
        .with_body(r#"{"error":"mapper_parsing_exception"}"#)
        .expect(1)
        .create_async()
        .await;

    let mut config = base_config();
    config.elasticsearch = Some(ElasticsearchConfig {
        endpoint: server.url(),
        index_prefix: "poc-logs".to_string(),
    });
    let pipeline = Pipeline::start(config).expect("failed to start pipeline");

    pipeline.emit(log_event("malformed")).await.unwrap();
    pipeline.flush(Duration::from_secs(5)).await.unwrap();

    mock.assert_async().await;

    let records = pipeline.dead_letters().drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::PermanentFailure);
    assert_eq!(records[0].attempts.len(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn sustained_failure_opens_the_breaker_and_probes_through_it() {
    let mut server = Server::new_async().await;
    // two failures open the breaker; every later hit is a half-open probe
    let mock = server
        .mock("POST", "/_bulk")
        .with_status(503)
        .expect(5)
        .create_async()
        .await;

    let mut config = base_config();
    config.retry.max_attempts = 5;
    config.breaker.threshold = 2;
    config.breaker.cooldown = Duration::from_millis(150);
    config.elasticsearch = Some(ElasticsearchConfig {
        endpoint: server.url(),
        index_prefix: "poc-logs".to_string(),
    });
    let pipeline = Pipeline::start(config).expect("failed to start pipeline");

    pipeline.emit(log_event("storm")).await.unwrap();
    pipeline.flush(Duration::from_secs(15)).await.unwrap();

    // attempts 1 and 2 trip the breaker, attempts 3-5 ride probes
    mock.assert_async().await;

    let records = pipeline.dead_letters().drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::RetriesExhausted);

    let snapshot = pipeline.stats();
    assert_eq!(snapshot.breakers.len(), 1);
    assert_eq!(snapshot.breakers[0].state, BreakerState::Open);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn backends_fail_independently() {
    let mut server = Server::new_async().await;
    let es_mock = server
        .mock("POST", "/_bulk")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let loki_mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "poc".to_string());

    let mut config = base_config();
    config.elasticsearch = Some(ElasticsearchConfig {
        endpoint: server.url(),
        index_prefix: "poc-logs".to_string(),
    });
    config.loki = Some(LokiConfig {
        endpoint: server.url(),
        labels,
    });
    let pipeline = Pipeline::start(config).expect("failed to start pipeline");

    pipeline.emit(log_event("split decision")).await.unwrap();
    pipeline.flush(Duration::from_secs(5)).await.unwrap();

    es_mock.assert_async().await;
    loki_mock.assert_async().await;

    // same event: delivered on loki, dead-lettered on elasticsearch
    let snapshot = pipeline.stats();
    assert_eq!(snapshot.events_delivered, 1);
    assert_eq!(snapshot.events_dead_lettered, 1);

    let records = pipeline.dead_letters().drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].backend, "elasticsearch");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn unreachable_backend_is_a_transient_failure() {
    // nothing listens here; connection errors classify as transient
    let mut config = base_config();
    config.retry.max_attempts = 2;
    config.request_timeout = Duration::from_millis(500);
    config.elasticsearch = Some(ElasticsearchConfig {
        endpoint: "http://127.0.0.1:9".to_string(),
        index_prefix: "poc-logs".to_string(),
    });
    let pipeline = Pipeline::start(config).expect("failed to start pipeline");

    pipeline.emit(log_event("nowhere to go")).await.unwrap();
    pipeline.flush(Duration::from_secs(10)).await.unwrap();

    let records = pipeline.dead_letters().drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(records[0].attempts.len(), 2);

    pipeline.shutdown().await;
}
