// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Circuit Breaker (C4): one state machine per `vendor:model`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

const FAILURE_THRESHOLD: u32 = 5;
const HOLD_MIN_SECS: u64 = 60;
const HOLD_MAX_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// What class of failure tripped the breaker — §3's per-class counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Server5xx,
    RateLimited429,
    Other,
}

struct Inner {
    state: CircuitState,
    open_until: Option<Instant>,
    counters: [u32; 3],
}

/// A breaker keyed on `vendor:model`. 4xx errors other than 429 never count
/// against it (§4.4) — only the caller decides whether to call
/// `record_failure`, so non-counting classes simply never invoke it.
pub struct CircuitBreaker {
    key: String,
    consecutive_5xx: AtomicU32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            consecutive_5xx: AtomicU32::new(0),
            inner: Mutex::new(Inner { state: CircuitState::Closed, open_until: None, counters: [0; 3] }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a call should be allowed right now. Never performs upstream
    /// I/O — an open breaker rejects in O(1), satisfying P5.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if inner.open_until.map(|t| Instant::now() >= t).unwrap_or(true) {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(circuit = %self.key, "circuit breaker half-open probe admitted");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_5xx.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Closed {
            tracing::info!(circuit = %self.key, previous = %inner.state, "circuit breaker closing after success");
        }
        inner.state = CircuitState::Closed;
        inner.open_until = None;
    }

    pub fn record_failure(&self, class: FailureClass) {
        let mut inner = self.inner.lock().unwrap();
        inner.counters[class as usize] += 1;

        if class != FailureClass::Server5xx {
            // Only consecutive 5xx / upstream-unavailable trips the breaker.
            return;
        }

        let count = self.consecutive_5xx.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= FAILURE_THRESHOLD && inner.state != CircuitState::Open {
            let hold = Duration::from_secs(rand::thread_rng().gen_range(HOLD_MIN_SECS..=HOLD_MAX_SECS));
            inner.state = CircuitState::Open;
            inner.open_until = Some(Instant::now() + hold);
            tracing::warn!(circuit = %self.key, consecutive_5xx = count, hold_secs = hold.as_secs(), "circuit breaker OPEN");
        } else if count >= FAILURE_THRESHOLD {
            // Already open and the half-open probe failed: re-open for a
            // fresh randomized hold.
            let hold = Duration::from_secs(rand::thread_rng().gen_range(HOLD_MIN_SECS..=HOLD_MAX_SECS));
            inner.state = CircuitState::Open;
            inner.open_until = Some(Instant::now() + hold);
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }
}

/// Registry of breakers keyed on `vendor:model`, created lazily on first use.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, vendor: &str, model: &str) -> std::sync::Arc<CircuitBreaker> {
        let key = format!("{vendor}:{model}");
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(key.clone())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(key)))
            .clone()
    }
}
