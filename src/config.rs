//! Configuration for admission strategies and the middleware.
//!
//! Every config type validates at construction time; a zero window or an
//! inverted concurrency range is an [`AdmissionError::InvalidConfiguration`]
//! before the server takes traffic, never a surprise during a request.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::DEFAULT_TRUSTED_PROXY_HEADERS;
use crate::error::{AdmissionError, Result};
use crate::limiter::{
    AdaptiveLimiter, Counter, FixedWindowLimiter, KeyPolicy, Limiter, LocalCounter, RedisCounter,
    TokenBucketLimiter,
};

/// Top-level strategy selection, loadable from YAML:
///
/// ```yaml
/// strategy: fixed_window
/// limit: 100
/// window: 60s
/// key: client_ip
/// backend:
///   type: redis
///   url: redis://127.0.0.1:6379
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LimiterConfig {
    /// Admit everything.
    NoOp,
    TokenBucket(TokenBucketConfig),
    FixedWindow(FixedWindowConfig),
    Adaptive(AdaptiveConfig),
}

impl LimiterConfig {
    /// Load and validate a configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AdmissionError::InvalidConfiguration(format!("read {path}: {e}")))?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            LimiterConfig::NoOp => Ok(()),
            LimiterConfig::TokenBucket(config) => config.validate(),
            LimiterConfig::FixedWindow(config) => config.validate(),
            LimiterConfig::Adaptive(config) => config.validate(),
        }
    }

    /// Construct the configured [`Limiter`].
    ///
    /// Async because a redis-backed window limiter connects to its store
    /// here; every other strategy builds synchronously.
    pub async fn build(self) -> Result<Limiter> {
        match self {
            LimiterConfig::NoOp => Ok(Limiter::NoOp),
            LimiterConfig::TokenBucket(config) => {
                Ok(Limiter::TokenBucket(TokenBucketLimiter::new(config)?))
            }
            LimiterConfig::FixedWindow(config) => {
                let counter: Arc<dyn Counter> = match &config.backend {
                    BackendConfig::Local => Arc::new(LocalCounter::new()),
                    BackendConfig::Redis { url, key_prefix } => {
                        Arc::new(RedisCounter::connect(url, key_prefix.clone()).await?)
                    }
                };
                Ok(Limiter::FixedWindow(FixedWindowLimiter::new(
                    config, counter,
                )?))
            }
            LimiterConfig::Adaptive(config) => {
                Ok(Limiter::Adaptive(AdaptiveLimiter::new(config)?))
            }
        }
    }
}

/// Fixed-window counting parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Admissions allowed per key per window.
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// How the counting key is derived.
    #[serde(default)]
    pub key: KeyPolicy,

    /// Where counts live: this process or a shared store.
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window: default_window(),
            key: KeyPolicy::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl FixedWindowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "fixed window limit must be at least 1".into(),
            ));
        }
        if self.window.is_zero() {
            return Err(AdmissionError::InvalidConfiguration(
                "fixed window length must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Counter backend selection for the fixed-window strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process counting; each server process limits independently.
    #[default]
    Local,
    /// Counting in a shared redis store; all processes sharing the store
    /// observe one consistent count per key.
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

/// Token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum burst, in tokens.
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Tokens refilled per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// How long a request may wait for a token before being rejected.
    /// Absent (or zero) means reject immediately.
    #[serde(default, with = "humantime_serde")]
    pub max_wait: Option<Duration>,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            max_wait: None,
        }
    }
}

impl TokenBucketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "token bucket capacity must be at least 1".into(),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(AdmissionError::InvalidConfiguration(
                "token bucket refill rate must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

/// Adaptive concurrency estimator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Ceiling before any completions have been observed.
    #[serde(default = "default_initial_concurrency")]
    pub initial_concurrency: usize,

    /// The ceiling never backs off below this.
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,

    /// The ceiling never probes above this.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Width of one sample bucket.
    #[serde(default = "default_bucket_width", with = "humantime_serde")]
    pub bucket_width: Duration,

    /// Buckets in the rolling window.
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,

    /// A window is degraded when its mean latency exceeds the baseline
    /// by this factor.
    #[serde(default = "default_latency_tolerance")]
    pub latency_tolerance: f64,

    /// Multiplier applied to the ceiling on a degraded window.
    #[serde(default = "default_backoff_ratio")]
    pub backoff_ratio: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: default_initial_concurrency(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            bucket_width: default_bucket_width(),
            bucket_count: default_bucket_count(),
            latency_tolerance: default_latency_tolerance(),
            backoff_ratio: default_backoff_ratio(),
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_concurrency == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "minimum concurrency must be at least 1".into(),
            ));
        }
        if self.initial_concurrency < self.min_concurrency
            || self.initial_concurrency > self.max_concurrency
        {
            return Err(AdmissionError::InvalidConfiguration(
                "initial concurrency must lie within [min, max]".into(),
            ));
        }
        if self.bucket_count < 2 {
            return Err(AdmissionError::InvalidConfiguration(
                "sample window needs at least 2 buckets".into(),
            ));
        }
        if self.bucket_width.is_zero() {
            return Err(AdmissionError::InvalidConfiguration(
                "bucket width must be positive".into(),
            ));
        }
        if !self.latency_tolerance.is_finite() || self.latency_tolerance < 1.0 {
            return Err(AdmissionError::InvalidConfiguration(
                "latency tolerance must be at least 1.0".into(),
            ));
        }
        if !self.backoff_ratio.is_finite() || self.backoff_ratio <= 0.0 || self.backoff_ratio >= 1.0
        {
            return Err(AdmissionError::InvalidConfiguration(
                "backoff ratio must lie strictly between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

/// Middleware-boundary behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// What to do with a request when the counter backend is down.
    #[serde(default)]
    pub on_backend_error: BackendErrorPolicy,

    /// Headers consulted, in order, for the client address.
    #[serde(default = "default_trusted_proxy_headers")]
    pub trusted_proxy_headers: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            on_backend_error: BackendErrorPolicy::default(),
            trusted_proxy_headers: default_trusted_proxy_headers(),
        }
    }
}

/// Availability-vs-strictness policy for backend failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorPolicy {
    /// Reject the request with an internal error.
    #[default]
    FailClosed,
    /// Admit the request without counting it.
    FailOpen,
}

fn default_limit() -> u64 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_key_prefix() -> String {
    "turnstile:".to_string()
}

fn default_capacity() -> u64 {
    100
}

fn default_refill_rate() -> f64 {
    100.0
}

fn default_initial_concurrency() -> usize {
    16
}

fn default_min_concurrency() -> usize {
    1
}

fn default_max_concurrency() -> usize {
    1024
}

fn default_bucket_width() -> Duration {
    Duration::from_millis(100)
}

fn default_bucket_count() -> usize {
    10
}

fn default_latency_tolerance() -> f64 {
    2.0
}

fn default_backoff_ratio() -> f64 {
    0.75
}

fn default_trusted_proxy_headers() -> Vec<String> {
    DEFAULT_TRUSTED_PROXY_HEADERS
        .iter()
        .map(|h| h.to_string())
        .collect()
}
