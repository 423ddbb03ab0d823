// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event model for the pipeline.
//!
//! Two event kinds flow through the pipeline: structured log records and
//! finished spans. They share nothing on the wire, so they travel in
//! separate lanes (see [`Lane`]) and are never mixed inside one batch.
//! Events are immutable once constructed; ownership moves to the queue on
//! enqueue.

use std::fmt;

use serde::Serialize;

/// Severity of a log event.
///
/// The vocabulary matches what producers emit (six levels, `Information`
/// rather than `Info`) so shipped documents carry the producer's own words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "Trace",
            LogLevel::Debug => "Debug",
            LogLevel::Information => "Information",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Critical => "Critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

/// Opaque 128-bit trace identifier. Lowercase hex on every wire format.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        TraceId(value.to_be_bytes())
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(bytes)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex())
    }
}

/// Opaque 64-bit span identifier. Lowercase hex on every wire format.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        SpanId(value.to_be_bytes())
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        SpanId(bytes)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(16);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.to_hex())
    }
}

/// A structured log record.
///
/// `fields` preserves the producer's insertion order. `timestamp_ms` is epoch
/// milliseconds, set at creation time; backend adapters that need finer
/// resolution scale it at serialization time.
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
    pub fields: Vec<(String, serde_json::Value)>,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
    pub service: String,
}

/// A finished span.
#[derive(Clone, Debug)]
pub struct SpanEvent {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub status: SpanStatus,
    pub tags: Vec<(String, String)>,
    pub service: String,
}

/// Lane an event travels in. Log volume and span volume differ by orders of
/// magnitude in practice, so each lane batches independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    Logs,
    Spans,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Logs => f.write_str("logs"),
            Lane::Spans => f.write_str("spans"),
        }
    }
}

/// An event accepted by the pipeline.
#[derive(Clone, Debug)]
pub enum Event {
    Log(LogEvent),
    Span(SpanEvent),
}

impl Event {
    #[must_use]
    pub fn lane(&self) -> Lane {
        match self {
            Event::Log(_) => Lane::Logs,
            Event::Span(_) => Lane::Spans,
        }
    }
}

impl From<LogEvent> for Event {
    fn from(event: LogEvent) -> Self {
        Event::Log(event)
    }
}

impl From<SpanEvent> for Event {
    fn from(event: SpanEvent) -> Self {
        Event::Span(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_hex_is_32_lowercase_chars() {
        let id = TraceId::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        assert_eq!(id.to_hex(), "0123456789abcdef0123456789abcdef");
        assert_eq!(id.to_hex().len(), 32);
    }

    #[test]
    fn span_id_hex_is_16_chars_and_zero_padded() {
        let id = SpanId::from_u64(0xff);
        assert_eq!(id.to_hex(), "00000000000000ff");
    }

    #[test]
    fn trace_id_roundtrips_through_bytes() {
        let id = TraceId::from_u128(42);
        let other = TraceId::from_bytes(42u128.to_be_bytes());
        assert_eq!(id, other);
    }

    #[test]
    fn lane_follows_event_variant() {
        let log = Event::Log(LogEvent {
            timestamp_ms: 0,
            level: LogLevel::Information,
            message: "hello".to_string(),
            fields: Vec::new(),
            trace_id: None,
            span_id: None,
            service: "svc".to_string(),
        });
        assert_eq!(log.lane(), Lane::Logs);

        let span = Event::Span(SpanEvent {
            trace_id: TraceId::from_u128(1),
            span_id: SpanId::from_u64(2),
            parent_span_id: None,
            name: "op".to_string(),
            start_time_ms: 0,
            end_time_ms: 1,
            status: SpanStatus::Ok,
            tags: Vec::new(),
            service: "svc".to_string(),
        });
        assert_eq!(span.lane(), Lane::Spans);
    }

    #[test]
    fn level_display_matches_producer_vocabulary() {
        assert_eq!(LogLevel::Information.to_string(), "Information");
        assert_eq!(LogLevel::Critical.to_string(), "Critical");
        assert!(LogLevel::Trace < LogLevel::Error);
    }
}
