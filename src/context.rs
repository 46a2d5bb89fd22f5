//! Per-request context handed to admission strategies.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use tokio_util::sync::CancellationToken;

/// Headers consulted for the client address when the service sits behind
/// a trusted proxy. The first parseable value wins; the connection's peer
/// address is the fallback.
pub const DEFAULT_TRUSTED_PROXY_HEADERS: &[&str] = &["X-Forwarded-For", "X-Real-IP"];

/// The slice of a request that admission strategies are allowed to see:
/// a stable client identity and a cancellation handle.
///
/// The cancellation token is taken from the request's extensions when the
/// surrounding stack provides one (e.g. a deadline layer); otherwise it is
/// a fresh token that never fires.
#[derive(Debug, Clone)]
pub struct RequestContext {
    client_addr: Option<IpAddr>,
    uri: String,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Create a context directly. Intended for callers outside an HTTP
    /// stack and for tests.
    pub fn new(client_addr: Option<IpAddr>, uri: impl Into<String>) -> Self {
        Self {
            client_addr,
            uri: uri.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Replace the cancellation handle.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Build a context from an inbound request.
    pub fn from_request(request: &Request, trusted_proxy_headers: &[String]) -> Self {
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        let cancellation = request
            .extensions()
            .get::<CancellationToken>()
            .cloned()
            .unwrap_or_default();

        Self {
            client_addr: client_ip(request.headers(), remote_addr, trusted_proxy_headers),
            uri: request.uri().to_string(),
            cancellation,
        }
    }

    /// The client's address, if one could be determined.
    pub fn client_addr(&self) -> Option<IpAddr> {
        self.client_addr
    }

    /// The full request URI (path and query).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Cancellation handle for bounded admission waits.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Extract the client IP, preferring trusted proxy headers over the peer
/// address. `X-Forwarded-For` may carry a chain; the first entry is the
/// originating client.
fn client_ip(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    trusted_proxy_headers: &[String],
) -> Option<IpAddr> {
    for name in trusted_proxy_headers {
        let Some(value) = headers.get(name.as_str()) else {
            continue;
        };
        let Ok(value) = value.to_str() else {
            continue;
        };
        let first = value.split(',').next().unwrap_or(value).trim();
        if let Ok(ip) = first.parse() {
            return Some(ip);
        }
    }

    remote_addr.map(|addr| addr.ip())
}
