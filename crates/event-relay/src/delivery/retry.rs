// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backoff schedule for transient send failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

// Jitter stays inside [0.75, 1.25] so that with a multiplier of 2 the
// jittered delays remain strictly increasing below the cap: the lowest
// possible next delay (0.75 * 2x) still exceeds the highest possible
// current one (1.25 * x).
const JITTER_LOW: f64 = 0.75;
const JITTER_HIGH: f64 = 1.25;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        RetryPolicy { config }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay to wait after the given failed attempt (1-based) before the
    /// next one.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
        self.delay_with_jitter(attempt, factor)
    }

    fn delay_with_jitter(&self, attempt: u32, factor: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1).min(64)).unwrap_or(64);
        let raw_ms = self.config.base_delay.as_millis() as f64 * self.config.multiplier.powi(exponent);
        let cap_ms = self.config.cap.as_millis() as f64;
        let jittered_ms = (raw_ms * factor).min(cap_ms);
        Duration::from_millis(jittered_ms as u64)
    }
}
