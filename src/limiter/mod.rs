//! Admission strategies and the commit handle they hand back.

mod adaptive;
mod bucket;
mod counter;
mod redis;
mod window;

pub use adaptive::AdaptiveLimiter;
pub use bucket::TokenBucketLimiter;
pub use counter::{spawn_purge_task, Counter, LocalCounter};
pub use self::redis::RedisCounter;
pub use window::{FixedWindowLimiter, KeyPolicy};

use crate::context::RequestContext;
use crate::error::Result;

/// How an admitted request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// The commit half of an admission decision.
///
/// Strategies that account for outstanding work (the adaptive limiter)
/// attach a hook that must run exactly once per admitted request. The
/// hook fires either through [`Admission::complete`] or, if the holder
/// unwinds or is dropped mid-request, through `Drop` with
/// [`Outcome::Failure`]. It can never fire twice.
pub struct Admission {
    hook: Option<Box<dyn FnOnce(Outcome) + Send>>,
}

impl Admission {
    /// An admission with nothing to commit.
    pub fn noop() -> Self {
        Self { hook: None }
    }

    /// An admission whose completion must be reported.
    pub(crate) fn with_hook(hook: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Self {
            hook: Some(Box::new(hook)),
        }
    }

    /// Report the request's outcome and consume the admission.
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(hook) = self.hook.take() {
            hook(outcome);
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook(Outcome::Failure);
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("committed", &self.hook.is_none())
            .finish()
    }
}

/// The configured admission strategy for a service.
///
/// Shared across all request-handling tasks for the process lifetime;
/// every variant is internally synchronized.
pub enum Limiter {
    /// Admit everything. Selected when no limiter is configured.
    NoOp,
    TokenBucket(TokenBucketLimiter),
    FixedWindow(FixedWindowLimiter),
    Adaptive(AdaptiveLimiter),
}

impl Limiter {
    /// Decide whether the request may proceed.
    ///
    /// Returns the commit handle on admission. Non-blocking for every
    /// strategy except a token bucket configured with a wait budget.
    pub async fn allow(&self, ctx: &RequestContext) -> Result<Admission> {
        match self {
            Limiter::NoOp => Ok(Admission::noop()),
            Limiter::TokenBucket(bucket) => bucket.allow(ctx).await,
            Limiter::FixedWindow(window) => window.allow(ctx).await,
            Limiter::Adaptive(adaptive) => adaptive.allow(ctx),
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Limiter::NoOp => "NoOp",
            Limiter::TokenBucket(_) => "TokenBucket",
            Limiter::FixedWindow(_) => "FixedWindow",
            Limiter::Adaptive(_) => "Adaptive",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_noop_admission_has_nothing_to_commit() {
        let admission = Admission::noop();
        admission.complete(Outcome::Success);
    }

    #[test]
    fn test_complete_fires_hook_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_hook = fired.clone();
        let admission = Admission::with_hook(move |outcome| {
            assert_eq!(outcome, Outcome::Success);
            fired_in_hook.fetch_add(1, Ordering::SeqCst);
        });

        admission.complete(Outcome::Success);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_without_complete_reports_failure() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_hook = fired.clone();
        {
            let _admission = Admission::with_hook(move |outcome| {
                assert_eq!(outcome, Outcome::Failure);
                fired_in_hook.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_noop_limiter_always_admits() {
        let limiter = Limiter::NoOp;
        let ctx = RequestContext::new(None, "/");
        for _ in 0..1000 {
            assert!(limiter.allow(&ctx).await.is_ok());
        }
    }
}
