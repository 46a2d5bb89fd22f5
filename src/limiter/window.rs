//! Fixed-window counting strategy.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::counter::Counter;
use super::Admission;
use crate::config::FixedWindowConfig;
use crate::context::RequestContext;
use crate::error::{AdmissionError, Result};

/// How the per-client counting key is derived from a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Count per client address. Falls back to the request URI when the
    /// connection carries no usable peer address.
    #[default]
    ClientIp,
    /// Count per full request URI.
    RequestUri,
}

impl KeyPolicy {
    pub fn derive(&self, ctx: &RequestContext) -> String {
        match self {
            KeyPolicy::ClientIp => match ctx.client_addr() {
                Some(addr) => addr.to_string(),
                None => ctx.uri().to_string(),
            },
            KeyPolicy::RequestUri => ctx.uri().to_string(),
        }
    }
}

/// Admits up to `limit` requests per key per window, delegating the
/// counting to a pluggable [`Counter`] backend.
pub struct FixedWindowLimiter {
    limit: u64,
    window: Duration,
    key: KeyPolicy,
    counter: Arc<dyn Counter>,
}

impl FixedWindowLimiter {
    pub fn new(config: FixedWindowConfig, counter: Arc<dyn Counter>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            limit: config.limit,
            window: config.window,
            key: config.key,
            counter,
        })
    }

    pub async fn allow(&self, ctx: &RequestContext) -> Result<Admission> {
        let key = self.key.derive(ctx);
        let count = self.counter.count(&key, self.limit, self.window).await?;
        if count > self.limit {
            return Err(AdmissionError::RateLimitExceeded {
                // The window length bounds the wait from above.
                retry_after: Some(self.window),
            });
        }
        // Counting is the whole of this strategy's accounting.
        Ok(Admission::noop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::counter::LocalCounter;

    fn limiter(limit: u64, window: Duration, key: KeyPolicy) -> FixedWindowLimiter {
        FixedWindowLimiter::new(
            FixedWindowConfig {
                limit,
                window,
                key,
                backend: Default::default(),
            },
            Arc::new(LocalCounter::new()),
        )
        .unwrap()
    }

    fn ctx(addr: &str, uri: &str) -> RequestContext {
        RequestContext::new(Some(addr.parse().unwrap()), uri)
    }

    #[tokio::test]
    async fn test_admits_exactly_limit_then_rejects() {
        let limiter = limiter(10, Duration::from_secs(10), KeyPolicy::ClientIp);
        let ctx = ctx("192.0.2.1", "/");

        for _ in 0..10 {
            assert!(limiter.allow(&ctx).await.is_ok());
        }
        for _ in 0..10 {
            assert!(matches!(
                limiter.allow(&ctx).await,
                Err(AdmissionError::RateLimitExceeded { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_window_rollover_admits_again() {
        let limiter = limiter(2, Duration::from_millis(30), KeyPolicy::ClientIp);
        let ctx = ctx("192.0.2.1", "/");

        assert!(limiter.allow(&ctx).await.is_ok());
        assert!(limiter.allow(&ctx).await.is_ok());
        assert!(limiter.allow(&ctx).await.is_err());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.allow(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_clients_are_limited_independently() {
        let limiter = limiter(1, Duration::from_secs(10), KeyPolicy::ClientIp);

        assert!(limiter.allow(&ctx("192.0.2.1", "/")).await.is_ok());
        assert!(limiter.allow(&ctx("192.0.2.1", "/")).await.is_err());
        assert!(limiter.allow(&ctx("192.0.2.2", "/")).await.is_ok());
    }

    #[tokio::test]
    async fn test_uri_policy_counts_per_endpoint() {
        let limiter = limiter(1, Duration::from_secs(10), KeyPolicy::RequestUri);

        assert!(limiter.allow(&ctx("192.0.2.1", "/a")).await.is_ok());
        // Different client, same URI: shares the budget.
        assert!(limiter.allow(&ctx("192.0.2.2", "/a")).await.is_err());
        assert!(limiter.allow(&ctx("192.0.2.1", "/b")).await.is_ok());
    }

    #[test]
    fn test_client_ip_policy_falls_back_to_uri() {
        let ctx = RequestContext::new(None, "/fallback");
        assert_eq!(KeyPolicy::ClientIp.derive(&ctx), "/fallback");
    }

    #[test]
    fn test_key_policy_serde_round_trip() {
        assert_eq!(
            serde_yaml::from_str::<KeyPolicy>("client_ip").unwrap(),
            KeyPolicy::ClientIp
        );
        assert_eq!(
            serde_yaml::to_string(&KeyPolicy::RequestUri).unwrap().trim(),
            "request_uri"
        );
    }

    #[test]
    fn test_zero_limit_is_rejected_at_construction() {
        let result = FixedWindowLimiter::new(
            FixedWindowConfig {
                limit: 0,
                window: Duration::from_secs(1),
                key: KeyPolicy::ClientIp,
                backend: Default::default(),
            },
            Arc::new(LocalCounter::new()),
        );
        assert!(matches!(
            result.err(),
            Some(AdmissionError::InvalidConfiguration(_))
        ));
    }
}
