//! Adaptive concurrency shedding from recent completion signals.
//!
//! Instead of a configured request budget, this strategy estimates how
//! much work the downstream can have in flight at once. The estimate is
//! AIMD: it backs off multiplicatively when completions fail or slow
//! down against a latency baseline, and probes one slot higher when a
//! window stays healthy while running at (or being pushed past) the
//! current ceiling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Admission, Outcome};
use crate::config::AdaptiveConfig;
use crate::context::RequestContext;
use crate::error::{AdmissionError, Result};

/// Sub-millisecond means are clock noise; the healthy band never
/// collapses below this.
const BASELINE_FLOOR: Duration = Duration::from_millis(1);

/// One slice of the rolling sample window.
#[derive(Debug, Default, Clone)]
struct SampleBucket {
    admitted: u64,
    rejected: u64,
    completions: u64,
    failures: u64,
    latency_sum: Duration,
    peak_inflight: usize,
}

#[derive(Debug)]
struct EstimatorState {
    ceiling: usize,
    buckets: Vec<SampleBucket>,
    head: usize,
    head_started: Instant,
    baseline_latency: Option<Duration>,
}

impl EstimatorState {
    fn new(config: &AdaptiveConfig, now: Instant) -> Self {
        Self {
            ceiling: config.initial_concurrency,
            buckets: vec![SampleBucket::default(); config.bucket_count],
            head: 0,
            head_started: now,
            baseline_latency: None,
        }
    }

    /// Advance the ring to `now`, re-estimating the ceiling at each
    /// bucket boundary crossed.
    fn rotate(&mut self, config: &AdaptiveConfig, now: Instant) {
        let width = config.bucket_width;
        let span = width * self.buckets.len() as u32;

        if now.duration_since(self.head_started) >= span {
            // Idle past the whole window: every sample is stale.
            self.re_estimate(config);
            for bucket in &mut self.buckets {
                *bucket = SampleBucket::default();
            }
            self.head_started = now;
            return;
        }

        while now.duration_since(self.head_started) >= width {
            self.re_estimate(config);
            self.head = (self.head + 1) % self.buckets.len();
            self.buckets[self.head] = SampleBucket::default();
            self.head_started += width;
        }
    }

    fn re_estimate(&mut self, config: &AdaptiveConfig) {
        let mut completions = 0u64;
        let mut failures = 0u64;
        let mut rejected = 0u64;
        let mut latency_sum = Duration::ZERO;
        let mut peak_inflight = 0usize;
        for bucket in &self.buckets {
            completions += bucket.completions;
            failures += bucket.failures;
            rejected += bucket.rejected;
            latency_sum += bucket.latency_sum;
            peak_inflight = peak_inflight.max(bucket.peak_inflight);
        }
        if completions == 0 {
            return;
        }

        let mean = (latency_sum / completions as u32).max(BASELINE_FLOOR);
        let baseline = match self.baseline_latency {
            // Drift upward slowly so the baseline can follow a genuine
            // shift in service time instead of pinning to the best ever.
            Some(previous) => mean.min(previous.mul_f64(1.05)),
            None => mean,
        };
        self.baseline_latency = Some(baseline);

        if failures > 0 || mean > baseline.mul_f64(config.latency_tolerance) {
            let reduced = (self.ceiling as f64 * config.backoff_ratio) as usize;
            self.ceiling = reduced.max(config.min_concurrency);
        } else if peak_inflight >= self.ceiling || rejected > 0 {
            // Healthy and saturated: probe one slot higher.
            self.ceiling = (self.ceiling + 1).min(config.max_concurrency);
        }
    }
}

/// Concurrency-shedding limiter.
///
/// Every admission hands back a commit hook that must fire exactly once;
/// a hook that never fires would leave the inflight count biased upward
/// for the life of the process. [`Admission`]'s drop guard makes that
/// structurally impossible for well-typed callers.
pub struct AdaptiveLimiter {
    config: AdaptiveConfig,
    inflight: Arc<AtomicUsize>,
    state: Arc<Mutex<EstimatorState>>,
}

impl AdaptiveLimiter {
    pub fn new(config: AdaptiveConfig) -> Result<Self> {
        config.validate()?;
        let state = EstimatorState::new(&config, Instant::now());
        Ok(Self {
            inflight: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(Mutex::new(state)),
            config,
        })
    }

    pub fn allow(&self, _ctx: &RequestContext) -> Result<Admission> {
        let started = Instant::now();
        {
            let mut state = self.state.lock();
            state.rotate(&self.config, started);
            let head = state.head;
            if self.inflight.load(Ordering::Acquire) >= state.ceiling {
                state.buckets[head].rejected += 1;
                return Err(AdmissionError::RateLimitExceeded { retry_after: None });
            }
            let inflight_now = self.inflight.fetch_add(1, Ordering::AcqRel) + 1;
            let bucket = &mut state.buckets[head];
            bucket.admitted += 1;
            bucket.peak_inflight = bucket.peak_inflight.max(inflight_now);
        }

        let inflight = Arc::clone(&self.inflight);
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        Ok(Admission::with_hook(move |outcome| {
            inflight.fetch_sub(1, Ordering::AcqRel);
            let mut state = state.lock();
            state.rotate(&config, Instant::now());
            let head = state.head;
            let bucket = &mut state.buckets[head];
            bucket.completions += 1;
            bucket.latency_sum += started.elapsed();
            if outcome == Outcome::Failure {
                bucket.failures += 1;
            }
        }))
    }

    /// Requests currently admitted but not yet completed.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// The current concurrency ceiling.
    pub fn ceiling(&self) -> usize {
        self.state.lock().ceiling
    }
}
