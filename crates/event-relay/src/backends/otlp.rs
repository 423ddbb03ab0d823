// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP/HTTP trace-export adapter.
//!
//! Serializes a span batch into one OTLP JSON frame: spans grouped by
//! resource (service name), then by trace in first-seen order, with
//! insertion order preserved inside each trace. Identity fields (`traceId`,
//! `spanId`, `parentSpanId`) are carried intact for every span, so a parent
//! present in the batch is never separated from its children by the
//! serializer.

use async_trait::async_trait;
use serde::Serialize;

use crate::backends::{post_payload, BackendAdapter, SendError, SerializeError, WirePayload};
use crate::batcher::Batch;
use crate::config::OtlpConfig;
use crate::event::{Event, Lane, SpanEvent, SpanStatus, TraceId};

const NANOS_PER_MILLI: u64 = 1_000_000;
const SCOPE_NAME: &str = "event-relay";

pub struct OtlpTrace {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportTraceRequest {
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans {
    resource: Resource,
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Serialize)]
struct Resource {
    attributes: Vec<KeyValue>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScopeSpans {
    scope: Scope,
    spans: Vec<OtlpSpan>,
}

#[derive(Serialize)]
struct Scope {
    name: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OtlpSpan {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: String,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    status: OtlpStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<KeyValue>,
}

#[derive(Serialize)]
struct OtlpStatus {
    code: &'static str,
}

#[derive(Serialize)]
struct KeyValue {
    key: String,
    value: AnyValue,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnyValue {
    string_value: String,
}

impl OtlpTrace {
    #[must_use]
    pub fn new(config: &OtlpConfig, request_timeout: std::time::Duration) -> Self {
        OtlpTrace {
            client: super::build_client(request_timeout),
            url: format!("{}/v1/traces", config.endpoint.trim_end_matches('/')),
        }
    }

    fn otlp_span(span: &SpanEvent) -> OtlpSpan {
        OtlpSpan {
            trace_id: span.trace_id.to_hex(),
            span_id: span.span_id.to_hex(),
            parent_span_id: span.parent_span_id.map(|id| id.to_hex()),
            name: span.name.clone(),
            start_time_unix_nano: (span.start_time_ms * NANOS_PER_MILLI).to_string(),
            end_time_unix_nano: (span.end_time_ms * NANOS_PER_MILLI).to_string(),
            status: OtlpStatus {
                code: match span.status {
                    SpanStatus::Ok => "STATUS_CODE_OK",
                    SpanStatus::Error => "STATUS_CODE_ERROR",
                },
            },
            attributes: span
                .tags
                .iter()
                .map(|(key, value)| KeyValue {
                    key: key.clone(),
                    value: AnyValue {
                        string_value: value.clone(),
                    },
                })
                .collect(),
        }
    }
}

#[async_trait]
impl BackendAdapter for OtlpTrace {
    fn name(&self) -> &str {
        "otlp"
    }

    fn lane(&self) -> Lane {
        Lane::Spans
    }

    fn serialize(&self, batch: &Batch) -> Result<WirePayload, SerializeError> {
        // group by service in first-seen order, then by trace in first-seen
        // order within the service, keeping insertion order inside a trace
        let mut services: Vec<(&str, Vec<&SpanEvent>)> = Vec::new();
        for event in &batch.events {
            let Event::Span(span) = event else {
                return Err(SerializeError::WrongLane {
                    expected: Lane::Spans,
                    actual: batch.lane,
                });
            };
            match services.iter_mut().find(|(name, _)| *name == span.service) {
                Some((_, spans)) => spans.push(span),
                None => services.push((&span.service, vec![span])),
            }
        }

        let resource_spans = services
            .into_iter()
            .map(|(service, spans)| {
                let mut trace_order: Vec<TraceId> = Vec::new();
                for span in &spans {
                    if !trace_order.contains(&span.trace_id) {
                        trace_order.push(span.trace_id);
                    }
                }
                let mut ordered = Vec::with_capacity(spans.len());
                for trace_id in trace_order {
                    for span in spans.iter().filter(|s| s.trace_id == trace_id) {
                        ordered.push(Self::otlp_span(span));
                    }
                }
                ResourceSpans {
                    resource: Resource {
                        attributes: vec![KeyValue {
                            key: "service.name".to_string(),
                            value: AnyValue {
                                string_value: service.to_string(),
                            },
                        }],
                    },
                    scope_spans: vec![ScopeSpans {
                        scope: Scope { name: SCOPE_NAME },
                        spans: ordered,
                    }],
                }
            })
            .collect();

        Ok(WirePayload {
            content_type: "application/json",
            body: serde_json::to_vec(&ExportTraceRequest { resource_spans })?,
        })
    }

    async fn send(&self, payload: &WirePayload) -> Result<(), SendError> {
        post_payload(&self.client, &self.url, payload).await
    }
}
