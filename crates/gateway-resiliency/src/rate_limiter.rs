// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Rate Limiter (C3): per-vendor concurrency + sliding-minute token budget
//! with an adaptive multiplier for grounded calls' historical over-consumption.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded wait before the limiter gives up and lets the call through
/// ungated (P7: no deadlock).
const BYPASS_TIMEOUT: Duration = Duration::from_secs(1);
const EMA_ALPHA: f64 = 0.2;
const TRIM_THRESHOLD: f64 = 0.9;

pub enum Admission {
    Permit(OwnedSemaphorePermit),
    /// The permit could not be acquired within the bounded wait; the call
    /// proceeds ungated. The caller must record `limiter_bypassed=true` in
    /// telemetry.
    Bypassed,
}

struct State {
    minute_start: Instant,
    consumed_this_minute: u32,
    /// EMA(actual/estimated), clamped to [1.0, 2.0].
    multiplier: f64,
}

impl State {
    fn roll_if_needed(&mut self) {
        if self.minute_start.elapsed() >= Duration::from_secs(60) {
            self.minute_start = Instant::now();
            self.consumed_this_minute = 0;
        }
    }
}

/// One instance per vendor.
pub struct RateLimiter {
    tpm_budget: u32,
    semaphore: Arc<Semaphore>,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(tpm_budget: u32, max_concurrency: usize) -> Self {
        Self {
            tpm_budget,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            state: Mutex::new(State { minute_start: Instant::now(), consumed_this_minute: 0, multiplier: 1.0 }),
        }
    }

    /// Admit a call expecting to use `estimated_tokens`. Sleeps (with
    /// jittered backoff to the next minute boundary) if admitting would
    /// exceed the budget, but never blocks longer than [`BYPASS_TIMEOUT`]
    /// total before falling back to [`Admission::Bypassed`].
    pub async fn acquire(&self, estimated_tokens: u32) -> Admission {
        match tokio::time::timeout(BYPASS_TIMEOUT, self.acquire_inner(estimated_tokens)).await {
            Ok(permit) => Admission::Permit(permit),
            Err(_) => {
                tracing::warn!(estimated_tokens, "rate limiter bypassed after bounded wait");
                Admission::Bypassed
            }
        }
    }

    async fn acquire_inner(&self, estimated_tokens: u32) -> OwnedSemaphorePermit {
        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        loop {
            let remaining = {
                let mut state = self.state.lock().unwrap();
                state.roll_if_needed();
                let scaled = (estimated_tokens as f64 * state.multiplier).ceil() as u32;
                if state.consumed_this_minute.saturating_add(scaled) <= self.tpm_budget {
                    state.consumed_this_minute += scaled;
                    return permit;
                }
                (state.minute_start + Duration::from_secs(60)).saturating_duration_since(Instant::now())
            };
            let jitter = rand::thread_rng().gen_range(0.5..0.75);
            tokio::time::sleep(remaining.mul_f64(jitter)).await;
        }
    }

    /// Update the adaptive multiplier after a call completes.
    pub fn commit(&self, actual_tokens: u32, estimated_tokens: u32, _grounded: bool) {
        if estimated_tokens == 0 {
            return;
        }
        let ratio = actual_tokens as f64 / estimated_tokens as f64;
        let mut state = self.state.lock().unwrap();
        let ema = EMA_ALPHA * ratio + (1.0 - EMA_ALPHA) * state.multiplier;
        state.multiplier = ema.clamp(1.0, 2.0);
    }

    /// When within [`TRIM_THRESHOLD`] of the budget, suggest a reduced
    /// `max_tokens`, never below `min_out`.
    pub fn suggest_trim(&self, desired_out: u32, min_out: u32) -> u32 {
        let state = self.state.lock().unwrap();
        let used_fraction = state.consumed_this_minute as f64 / self.tpm_budget.max(1) as f64;
        if used_fraction >= TRIM_THRESHOLD {
            (desired_out / 2).max(min_out)
        } else {
            desired_out
        }
    }

    pub fn current_multiplier(&self) -> f64 {
        self.state.lock().unwrap().multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_admits_within_budget() {
        let limiter = RateLimiter::new(1000, 4);
        let admission = limiter.acquire(100).await;
        assert!(matches!(admission, Admission::Permit(_)));
    }

    #[tokio::test]
    async fn acquire_bypasses_when_concurrency_exhausted() {
        let limiter = RateLimiter::new(1_000_000, 1);
        let first = limiter.acquire(1).await;
        assert!(matches!(first, Admission::Permit(_)));
        // Second call cannot get the single concurrency slot within the
        // bounded wait, so it must bypass rather than deadlock (P7).
        let second = limiter.acquire(1).await;
        assert!(matches!(second, Admission::Bypassed));
    }

    #[test]
    fn commit_clamps_multiplier_to_two() {
        let limiter = RateLimiter::new(1000, 4);
        for _ in 0..50 {
            limiter.commit(1000, 10, true); // wildly over-estimate ratio
        }
        assert!(limiter.current_multiplier() <= 2.0);
    }

    #[test]
    fn commit_clamps_multiplier_to_one() {
        let limiter = RateLimiter::new(1000, 4);
        for _ in 0..50 {
            limiter.commit(1, 1000, false); // wildly under ratio
        }
        assert!(limiter.current_multiplier() >= 1.0);
    }

    #[test]
    fn suggest_trim_reduces_near_budget_exhaustion() {
        let limiter = RateLimiter::new(1000, 4);
        {
            let mut state = limiter.state.lock().unwrap();
            state.consumed_this_minute = 950;
        }
        let trimmed = limiter.suggest_trim(4000, 16);
        assert!(trimmed < 4000);
        assert!(trimmed >= 16);
    }

    #[test]
    fn suggest_trim_never_goes_below_min_out() {
        let limiter = RateLimiter::new(1000, 4);
        {
            let mut state = limiter.state.lock().unwrap();
            state.consumed_this_minute = 999;
        }
        let trimmed = limiter.suggest_trim(20, 16);
        assert_eq!(trimmed, 16);
    }

    #[test]
    fn suggest_trim_keeps_desired_when_under_threshold() {
        let limiter = RateLimiter::new(1000, 4);
        assert_eq!(limiter.suggest_trim(4000, 16), 4000);
    }
}
