// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-backend circuit breaker.
//!
//! Closed → (threshold consecutive transient failures) → Open →
//! (cooldown elapsed) → HalfOpen with exactly one in-flight probe →
//! Closed on probe success, back to Open on probe failure. Permanent
//! failures never touch the breaker; they say nothing about backend health.

use std::sync::Mutex;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BreakerConfig;

/// Externally visible breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a send may proceed right now. When the breaker is open and
    /// the cooldown has elapsed this admits exactly one caller, the
    /// half-open probe, and rejects everyone else until the probe settles.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed { .. } => true,
            State::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    debug!(backend = %self.name, "circuit breaker half-open, sending probe");
                    *state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => false,
        }
    }

    /// Whether a send is likely to be admitted, without consuming the probe.
    /// Used by the dispatcher to decide when to replay spillover.
    #[must_use]
    pub fn ready(&self) -> bool {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed { .. } => true,
            State::Open { since } => since.elapsed() >= self.config.cooldown,
            State::HalfOpen => false,
        }
    }

    pub fn on_success(&self) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if matches!(*state, State::HalfOpen | State::Open { .. }) {
            debug!(backend = %self.name, "circuit breaker closed");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn on_transient_failure(&self) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.threshold {
                    warn!(
                        backend = %self.name,
                        failures, "circuit breaker opened after consecutive transient failures"
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            State::HalfOpen => {
                warn!(backend = %self.name, "probe failed, circuit breaker re-opened");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
