//! Turnstile - Admission Control Middleware
//!
//! This crate decides, per inbound request, whether it may proceed,
//! under a pluggable choice of strategies: token bucket, fixed-window
//! counting (in-process or backed by a shared redis store for
//! multi-process deployments), and adaptive concurrency shedding driven
//! by recent completion signals. An axum/tower layer orchestrates the
//! configured strategy and guarantees its commit accounting on every
//! request exit path.

pub mod config;
pub mod context;
pub mod error;
pub mod limiter;
pub mod middleware;

pub use config::{BackendConfig, BackendErrorPolicy, LimiterConfig, MiddlewareConfig};
pub use context::RequestContext;
pub use error::{AdmissionError, Result};
pub use limiter::{Admission, Limiter, Outcome};
pub use middleware::AdmissionLayer;
