//! Token bucket admission strategy.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::Admission;
use crate::config::TokenBucketConfig;
use crate::context::RequestContext;
use crate::error::{AdmissionError, Result};

/// A bounded pool of permits refilled over time.
///
/// Refill is lazy: each take computes the tokens earned since the last
/// one from wall-clock time, clamped to capacity. There is no background
/// timer, so precision after a long idle gap is bounded only by timestamp
/// resolution.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_rate: f64,
    max_wait: Option<Duration>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

impl TokenBucketLimiter {
    pub fn new(config: TokenBucketConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            capacity: config.capacity as f64,
            refill_rate: config.refill_rate,
            max_wait: config.max_wait.filter(|w| !w.is_zero()),
            state: Mutex::new(BucketState {
                tokens: config.capacity as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Take one token, or report how long until the next one refills.
    fn try_take(&self) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        state.refill(self.capacity, self.refill_rate);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        state.refill(self.capacity, self.refill_rate);
        state.tokens as u64
    }

    pub async fn allow(&self, ctx: &RequestContext) -> Result<Admission> {
        let mut wait = match self.try_take() {
            Ok(()) => return Ok(Admission::noop()),
            Err(wait) => wait,
        };

        let Some(max_wait) = self.max_wait else {
            return Err(AdmissionError::RateLimitExceeded {
                retry_after: Some(wait),
            });
        };

        let deadline = Instant::now() + max_wait;
        loop {
            if Instant::now() + wait > deadline {
                // No token can refill before the wait budget runs out.
                return Err(AdmissionError::RateLimitExceeded {
                    retry_after: Some(wait),
                });
            }
            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(AdmissionError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            match self.try_take() {
                Ok(()) => return Ok(Admission::noop()),
                // Another waiter got there first; wait for the next token.
                Err(next) => wait = next,
            }
        }
    }
}
