// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend adapters.
//!
//! An adapter turns a [`Batch`] into one backend-specific wire payload and
//! performs the network call. Adapters classify every failure as transient
//! (worth retrying: transport errors, 5xx, 429) or permanent (schema/auth
//! class 4xx responses, serialization failures); the delivery manager acts
//! on the classification, never on raw response details.

pub mod elasticsearch;
pub mod loki;
pub mod otlp;

pub use elasticsearch::ElasticsearchBulk;
pub use loki::LokiPush;
pub use otlp::OtlpTrace;

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use crate::batcher::Batch;
use crate::event::Lane;

/// A send failure, classified for the retry machinery.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Transport error or retryable status (5xx, 429).
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Non-retryable response (schema/auth class 4xx). Goes straight to the
    /// dead letter store.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// Failure to build a wire payload. Always permanent.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("batch lane {actual} not handled by this backend (expects {expected})")]
    WrongLane { expected: Lane, actual: Lane },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A serialized batch ready for one network call.
#[derive(Debug)]
pub struct WirePayload {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// A telemetry backend the pipeline can ship to.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable name used in stats, logs and dead letter records.
    fn name(&self) -> &str;

    /// The single lane this backend consumes.
    fn lane(&self) -> Lane;

    /// Builds the wire payload for a batch.
    fn serialize(&self, batch: &Batch) -> Result<WirePayload, SerializeError>;

    /// Performs the network call for a previously serialized payload.
    async fn send(&self, payload: &WirePayload) -> Result<(), SendError>;
}

/// Shared HTTP client construction for the bundled adapters.
pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// POSTs a payload and classifies the outcome.
pub(crate) async fn post_payload(
    client: &reqwest::Client,
    url: &str,
    payload: &WirePayload,
) -> Result<(), SendError> {
    let response = client
        .post(url)
        .header("Content-Type", payload.content_type)
        .body(payload.body.clone())
        .send()
        .await
        .map_err(|e| SendError::Transient(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// 5xx and 429 are retryable; every other 4xx is not.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> SendError {
    let detail = if body.is_empty() {
        format!("{status}")
    } else {
        let snippet: String = body.chars().take(256).collect();
        format!("{status}: {snippet}")
    };
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        SendError::Permanent(detail)
    } else {
        SendError::Transient(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "oops").is_transient());
    }

    #[test]
    fn rate_limiting_is_transient() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!classify_status(StatusCode::BAD_REQUEST, "mapping error").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn detail_keeps_a_bounded_body_snippet() {
        let long_body = "x".repeat(10_000);
        let err = classify_status(StatusCode::BAD_REQUEST, &long_body);
        let message = err.to_string();
        assert!(message.len() < 400);
    }
}
