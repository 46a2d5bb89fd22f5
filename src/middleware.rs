//! Admission middleware for axum/tower stacks.
//!
//! Orchestrates a configured [`Limiter`]: each request is checked before
//! the downstream handler runs, rejections become terminal responses,
//! and the admission's commit handle fires exactly once on every exit
//! path — normal return, error, panic, or a dropped request future.
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use turnstile::{AdmissionLayer, LimiterConfig};
//!
//! # async fn build() -> turnstile::Result<()> {
//! let limiter = LimiterConfig::from_yaml("strategy: fixed_window")?
//!     .build()
//!     .await?;
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "ok" }))
//!     .layer(AdmissionLayer::new(limiter));
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::config::{BackendErrorPolicy, MiddlewareConfig};
use crate::context::RequestContext;
use crate::error::AdmissionError;
use crate::limiter::{Admission, Limiter, Outcome};

/// Tower layer applying admission control to every request.
#[derive(Clone)]
pub struct AdmissionLayer {
    limiter: Arc<Limiter>,
    config: Arc<MiddlewareConfig>,
}

impl AdmissionLayer {
    /// Apply `limiter` with default middleware behavior (fail-closed).
    pub fn new(limiter: Limiter) -> Self {
        Self::with_config(limiter, MiddlewareConfig::default())
    }

    pub fn with_config(limiter: Limiter, config: MiddlewareConfig) -> Self {
        Self {
            limiter: Arc::new(limiter),
            config: Arc::new(config),
        }
    }

    /// A layer that admits everything; the default when no limiter is
    /// configured.
    pub fn noop() -> Self {
        Self::new(Limiter::NoOp)
    }

    /// The shared limiter, for introspection.
    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            limiter: self.limiter.clone(),
            config: self.config.clone(),
        }
    }
}

/// The per-request admission state machine:
/// checked, then either admitted (downstream runs, commit fires) or
/// rejected (a mapped terminal response, downstream never runs).
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    limiter: Arc<Limiter>,
    config: Arc<MiddlewareConfig>,
}

impl<S> Service<Request> for AdmissionService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let limiter = self.limiter.clone();
        let config = self.config.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ctx = RequestContext::from_request(&request, &config.trusted_proxy_headers);

            match limiter.allow(&ctx).await {
                Ok(admission) => forward(&mut inner, request, admission).await,
                Err(AdmissionError::BackendUnavailable(reason))
                    if config.on_backend_error == BackendErrorPolicy::FailOpen =>
                {
                    warn!(%reason, "counter backend unavailable, admitting request (fail-open)");
                    forward(&mut inner, request, Admission::noop()).await
                }
                Err(err) => Ok(reject(err)),
            }
        })
    }
}

/// Run the downstream handler with the admission held across the await:
/// a panic or a dropped request future still fires the commit hook, as a
/// failure, through the admission's drop guard.
async fn forward<S>(
    inner: &mut S,
    request: Request,
    admission: Admission,
) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response>,
{
    let result = inner.call(request).await;
    match &result {
        Ok(response) if !response.status().is_server_error() => {
            admission.complete(Outcome::Success)
        }
        _ => admission.complete(Outcome::Failure),
    }
    result
}

/// Map a rejection onto its terminal response.
fn reject(err: AdmissionError) -> Response {
    match err {
        AdmissionError::RateLimitExceeded { retry_after } => {
            debug!("request rejected: rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                axum::Json(serde_json::json!({
                    "error": {
                        "code": "rate_limit_exceeded",
                        "message": "too many requests",
                    }
                })),
            )
                .into_response();

            if let Some(retry_after) = retry_after {
                let secs = retry_after.as_secs().max(1);
                let reset_at = Utc::now().timestamp() + secs as i64;
                let headers = response.headers_mut();
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    headers.insert("Retry-After", value);
                }
                if let Ok(value) = HeaderValue::from_str(&reset_at.to_string()) {
                    headers.insert("X-RateLimit-Reset", value);
                }
            }
            response
        }
        AdmissionError::Cancelled => {
            debug!("request rejected: admission wait cancelled");
            (
                StatusCode::REQUEST_TIMEOUT,
                axum::Json(serde_json::json!({
                    "error": {
                        "code": "cancelled",
                        "message": "request cancelled while waiting for admission",
                    }
                })),
            )
                .into_response()
        }
        AdmissionError::BackendUnavailable(reason) => {
            warn!(%reason, "counter backend unavailable, rejecting request (fail-closed)");
            internal_error()
        }
        // Construction rejects bad configs; nothing reaches here at
        // request time.
        AdmissionError::InvalidConfiguration(reason) => {
            warn!(%reason, "limiter misconfiguration surfaced at request time");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({
            "error": {
                "code": "internal_error",
                "message": "admission check failed",
            }
        })),
    )
        .into_response()
}
