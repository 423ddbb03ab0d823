// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loki push adapter.
//!
//! Ships a log batch as one push request: log events sharing a label-set
//! form one stream of `[ns_timestamp, line]` pairs. Labels are a static
//! per-instance map from configuration and never derived from event
//! fields, so with one adapter instance there is exactly one stream.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::backends::{post_payload, BackendAdapter, SendError, SerializeError, WirePayload};
use crate::batcher::Batch;
use crate::config::LokiConfig;
use crate::event::{Event, Lane, LogEvent};

const NANOS_PER_MILLI: u64 = 1_000_000;

pub struct LokiPush {
    client: reqwest::Client,
    url: String,
    labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<PushStream<'a>>,
}

#[derive(Serialize)]
struct PushStream<'a> {
    stream: &'a BTreeMap<String, String>,
    values: Vec<(String, String)>,
}

impl LokiPush {
    #[must_use]
    pub fn new(config: &LokiConfig, request_timeout: std::time::Duration) -> Self {
        LokiPush {
            client: super::build_client(request_timeout),
            url: format!(
                "{}/loki/api/v1/push",
                config.endpoint.trim_end_matches('/')
            ),
            labels: config.labels.clone(),
        }
    }

    /// Renders one log event as a stream line. Reserved keys win over
    /// producer fields of the same name.
    fn line(log: &LogEvent) -> Result<String, serde_json::Error> {
        let mut object = serde_json::Map::new();
        for (key, value) in &log.fields {
            object.insert(key.clone(), value.clone());
        }
        object.insert(
            "level".to_string(),
            serde_json::Value::String(log.level.as_str().to_string()),
        );
        object.insert(
            "message".to_string(),
            serde_json::Value::String(log.message.clone()),
        );
        object.insert(
            "service".to_string(),
            serde_json::Value::String(log.service.clone()),
        );
        if let Some(trace_id) = log.trace_id {
            object.insert(
                "trace_id".to_string(),
                serde_json::Value::String(trace_id.to_hex()),
            );
        }
        if let Some(span_id) = log.span_id {
            object.insert(
                "span_id".to_string(),
                serde_json::Value::String(span_id.to_hex()),
            );
        }
        serde_json::to_string(&serde_json::Value::Object(object))
    }
}

#[async_trait]
impl BackendAdapter for LokiPush {
    fn name(&self) -> &str {
        "loki"
    }

    fn lane(&self) -> Lane {
        Lane::Logs
    }

    fn serialize(&self, batch: &Batch) -> Result<WirePayload, SerializeError> {
        let mut values = Vec::with_capacity(batch.len());
        for event in &batch.events {
            let Event::Log(log) = event else {
                return Err(SerializeError::WrongLane {
                    expected: Lane::Logs,
                    actual: batch.lane,
                });
            };
            let ns = log.timestamp_ms * NANOS_PER_MILLI;
            values.push((ns.to_string(), Self::line(log)?));
        }
        let request = PushRequest {
            streams: vec![PushStream {
                stream: &self.labels,
                values,
            }],
        };
        Ok(WirePayload {
            content_type: "application/json",
            body: serde_json::to_vec(&request)?,
        })
    }

    async fn send(&self, payload: &WirePayload) -> Result<(), SendError> {
        post_payload(&self.client, &self.url, payload).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::LogLevel;
    use std::time::Duration;

    fn adapter() -> LokiPush {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "demo".to_string());
        labels.insert("env".to_string(), "dev".to_string());
        LokiPush::new(
            &LokiConfig {
                endpoint: "http://loki:3100".to_string(),
                labels,
            },
            Duration::from_secs(5),
        )
    }

    fn log_at(timestamp_ms: u64, message: &str) -> Event {
        Event::Log(LogEvent {
            timestamp_ms,
            level: LogLevel::Information,
            message: message.to_string(),
            fields: vec![("attempt".to_string(), serde_json::json!(3))],
            trace_id: None,
            span_id: None,
            service: "svc".to_string(),
        })
    }

    #[test]
    fn single_stream_with_static_labels() {
        let batch = Batch {
            id: 1,
            lane: Lane::Logs,
            events: vec![log_at(1000, "a"), log_at(2000, "b")],
        };
        let payload = adapter().serialize(&batch).unwrap();
        assert_eq!(payload.content_type, "application/json");

        let parsed: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
        let streams = parsed["streams"].as_array().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0]["stream"]["app"], "demo");
        assert_eq!(streams[0]["stream"]["env"], "dev");
        assert_eq!(streams[0]["values"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn timestamps_are_nanoseconds_in_order() {
        let batch = Batch {
            id: 1,
            lane: Lane::Logs,
            events: vec![log_at(1000, "first"), log_at(2000, "second")],
        };
        let payload = adapter().serialize(&batch).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
        let values = parsed["streams"][0]["values"].as_array().unwrap();

        assert_eq!(values[0][0], "1000000000");
        assert_eq!(values[1][0], "2000000000");

        let line: serde_json::Value = serde_json::from_str(values[0][1].as_str().unwrap()).unwrap();
        assert_eq!(line["message"], "first");
        assert_eq!(line["level"], "Information");
        assert_eq!(line["attempt"], 3);
    }

    #[test]
    fn reserved_keys_win_over_producer_fields() {
        let batch = Batch {
            id: 1,
            lane: Lane::Logs,
            events: vec![Event::Log(LogEvent {
                timestamp_ms: 1,
                level: LogLevel::Error,
                message: "real message".to_string(),
                fields: vec![("message".to_string(), serde_json::json!("spoofed"))],
                trace_id: None,
                span_id: None,
                service: "svc".to_string(),
            })],
        };
        let payload = adapter().serialize(&batch).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
        let line: serde_json::Value = serde_json::from_str(
            parsed["streams"][0]["values"][0][1].as_str().unwrap(),
        )
        .unwrap();
        assert_eq!(line["message"], "real message");
    }

    #[test]
    fn push_url_is_derived_from_endpoint() {
        assert_eq!(adapter().url, "http://loki:3100/loki/api/v1/push");
    }
}
