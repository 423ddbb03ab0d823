// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Elasticsearch bulk-index adapter.
//!
//! Serializes a log batch into newline-delimited action/document pairs for
//! the `_bulk` API. The target index is `{prefix}-{yyyy.MM.dd}` computed
//! from each event's own timestamp (UTC), not from wall-clock send time, so
//! late-delivered events land in the dated index they belong to.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::backends::{post_payload, BackendAdapter, SendError, SerializeError, WirePayload};
use crate::batcher::Batch;
use crate::config::ElasticsearchConfig;
use crate::event::{Event, Lane, LogEvent};

pub struct ElasticsearchBulk {
    client: reqwest::Client,
    url: String,
    index_prefix: String,
}

#[derive(Serialize)]
struct BulkAction<'a> {
    index: IndexMeta<'a>,
}

#[derive(Serialize)]
struct IndexMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
}

#[derive(Serialize)]
struct LogDocument<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    level: &'static str,
    message: &'a str,
    service: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    span_id: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    fields: serde_json::Map<String, serde_json::Value>,
}

impl ElasticsearchBulk {
    #[must_use]
    pub fn new(config: &ElasticsearchConfig, request_timeout: std::time::Duration) -> Self {
        ElasticsearchBulk {
            client: super::build_client(request_timeout),
            url: format!("{}/_bulk", config.endpoint.trim_end_matches('/')),
            index_prefix: config.index_prefix.clone(),
        }
    }

    /// Dated index for an event, derived from the event timestamp.
    fn index_for(&self, timestamp_ms: u64) -> String {
        let date = i64::try_from(timestamp_ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(DateTime::UNIX_EPOCH);
        format!("{}-{}", self.index_prefix, date.format("%Y.%m.%d"))
    }

    fn document<'a>(log: &'a LogEvent) -> LogDocument<'a> {
        let timestamp = i64::try_from(log.timestamp_ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(DateTime::UNIX_EPOCH)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut fields = serde_json::Map::new();
        for (key, value) in &log.fields {
            fields.insert(key.clone(), value.clone());
        }
        LogDocument {
            timestamp,
            level: log.level.as_str(),
            message: &log.message,
            service: &log.service,
            trace_id: log.trace_id.map(|id| id.to_hex()),
            span_id: log.span_id.map(|id| id.to_hex()),
            fields,
        }
    }
}

#[async_trait]
impl BackendAdapter for ElasticsearchBulk {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    fn lane(&self) -> Lane {
        Lane::Logs
    }

    fn serialize(&self, batch: &Batch) -> Result<WirePayload, SerializeError> {
        let mut body = Vec::with_capacity(batch.len() * 256);
        for event in &batch.events {
            let Event::Log(log) = event else {
                return Err(SerializeError::WrongLane {
                    expected: Lane::Logs,
                    actual: batch.lane,
                });
            };
            let index = self.index_for(log.timestamp_ms);
            serde_json::to_writer(&mut body, &BulkAction {
                index: IndexMeta { index: &index },
            })?;
            body.push(b'\n');
            serde_json::to_writer(&mut body, &Self::document(log))?;
            body.push(b'\n');
        }
        Ok(WirePayload {
            content_type: "application/x-ndjson",
            body,
        })
    }

    async fn send(&self, payload: &WirePayload) -> Result<(), SendError> {
        post_payload(&self.client, &self.url, payload).await
    }
}
