// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Property tests: every accepted event lands in exactly one batch, in
//! per-lane insertion order, for arbitrary emission patterns and batch
//! sizes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;

use event_relay::{
    Batch, BackendAdapter, Event, Lane, LogEvent, LogLevel, Pipeline, PipelineConfig, SendError,
    SerializeError, WirePayload,
};

/// Collects delivered messages and batch sizes, in arrival order.
struct CollectingBackend {
    batches: Mutex<Vec<Vec<String>>>,
}

impl CollectingBackend {
    fn new() -> Arc<Self> {
        Arc::new(CollectingBackend {
            batches: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BackendAdapter for CollectingBackend {
    fn name(&self) -> &str {
        "collecting"
    }

    fn lane(&self) -> Lane {
        Lane::Logs
    }

    fn serialize(&self, batch: &Batch) -> Result<WirePayload, SerializeError> {
        let messages: Vec<String> = batch
            .events
            .iter()
            .map(|event| match event {
                Event::Log(log) => log.message.clone(),
                Event::Span(span) => span.name.clone(),
            })
            .collect();
        Ok(WirePayload {
            content_type: "application/json",
            body: serde_json::to_vec(&messages)?,
        })
    }

    async fn send(&self, payload: &WirePayload) -> Result<(), SendError> {
        let messages: Vec<String> = serde_json::from_slice(&payload.body)
            .map_err(|e| SendError::Permanent(e.to_string()))?;
        #[allow(clippy::unwrap_used)]
        self.batches.lock().unwrap().push(messages);
        Ok(())
    }
}

fn log_event(message: String) -> Event {
    Event::Log(LogEvent {
        timestamp_ms: 1,
        level: LogLevel::Information,
        message,
        fields: Vec::new(),
        trace_id: None,
        span_id: None,
        service: "prop".to_string(),
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_event_lands_once_in_order(
        count in 0usize..40,
        max_batch_size in 1usize..8,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("failed to build runtime");

        runtime.block_on(async move {
            let backend = CollectingBackend::new();
            let mut config = PipelineConfig::default();
            config.log_batch.max_batch_size = max_batch_size;
            config.log_batch.max_batch_age = Duration::from_millis(50);
            config.shutdown_grace = Duration::from_secs(5);
            // completion order across concurrent sends is unspecified, so
            // serialize delivery to make arrival order observable
            config.max_in_flight_per_backend = 1;

            let pipeline = Pipeline::start_with_backends(config, vec![backend.clone()])
                .expect("failed to start pipeline");

            let expected: Vec<String> = (0..count).map(|i| format!("event-{i}")).collect();
            for message in &expected {
                pipeline.emit(log_event(message.clone())).await.expect("emit failed");
            }
            pipeline.shutdown().await;

            let batches = backend.batches.lock().expect("lock poisoned").clone();
            // no batch exceeds the size limit
            for batch in &batches {
                assert!(batch.len() <= max_batch_size);
                assert!(!batch.is_empty());
            }
            // concatenated batches reproduce the emission sequence exactly:
            // nothing lost, nothing duplicated, order preserved
            let flattened: Vec<String> = batches.into_iter().flatten().collect();
            assert_eq!(flattened, expected);
        });
    }
}
