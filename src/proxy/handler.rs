//! Director and forwarder for proxied requests

use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::rewrite::target_url;
use super::server::ProxyState;

/// Connection-scoped headers that never cross the proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn gateway_error(reason: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("Gateway Error: {}", reason),
    )
        .into_response()
}

/// Where a request ends up and whether the balancer chose it
struct Selection {
    backend: String,
    balanced: bool,
}

/// Proxy request handler
pub struct ProxyHandler {
    state: ProxyState,
}

impl ProxyHandler {
    pub fn new(state: ProxyState) -> Self {
        Self { state }
    }

    /// Balancing key: the configured hash header when the request carries it,
    /// otherwise the client IP
    fn balance_key(&self, headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
        if let Some(name) = &self.state.config.proxy.hash_header {
            if let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                return value.to_string();
            }
        }
        remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
    }

    fn select(&self, key: &str) -> Option<Selection> {
        match self.state.balancer.get(key) {
            Ok(backend) => Some(Selection { backend, balanced: true }),
            Err(e) => {
                self.state.metrics.record_balancer_error();
                match &self.state.config.proxy.fallback_backend {
                    Some(fallback) => {
                        tracing::warn!(
                            error = %e,
                            fallback = %fallback,
                            strategy = self.state.balancer.strategy_name(),
                            "Load balancer error, using fallback backend"
                        );
                        self.state.metrics.record_fallback();
                        Some(Selection {
                            backend: fallback.clone(),
                            balanced: false,
                        })
                    }
                    None => {
                        tracing::warn!(error = %e, "Load balancer error and no fallback backend configured");
                        None
                    }
                }
            }
        }
    }

    fn forwarded_for(headers: &HeaderMap, remote: Option<SocketAddr>) -> Option<HeaderValue> {
        let ip = remote?.ip().to_string();
        let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ip),
            _ => ip,
        };
        HeaderValue::from_str(&value).ok()
    }

    fn fail(&self, selection: &Selection, start: Instant, reason: impl std::fmt::Display) -> Response {
        tracing::error!(backend = %selection.backend, error = %reason, "Proxy error");
        self.state.metrics.record_failure(start.elapsed());
        if selection.balanced && self.state.config.balancer.degrade_on_error {
            self.state.balancer.report_failure(&selection.backend);
        }
        gateway_error(reason)
    }

    /// Handle an incoming request
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let start = Instant::now();
        self.state.metrics.record_request();

        let remote = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let key = self.balance_key(req.headers(), remote);

        let Some(selection) = self.select(&key) else {
            self.state.metrics.record_failure(start.elapsed());
            return (StatusCode::SERVICE_UNAVAILABLE, "No backend available").into_response();
        };
        self.state.metrics.record_selection(&selection.backend);

        let (parts, body) = req.into_parts();
        let path = self.state.rewriter.rewrite(parts.uri.path()).into_owned();
        let url = match target_url(&selection.backend, &path, parts.uri.query()) {
            Ok(url) => url,
            Err(e) => {
                return self.fail(&selection, start, format!("invalid backend url '{}': {}", selection.backend, e))
            }
        };

        tracing::debug!(
            method = %parts.method,
            path = %parts.uri.path(),
            key = %key,
            backend_url = %url,
            "Forwarding request"
        );

        let body_bytes = match to_bytes(body, self.state.config.proxy.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read request body");
                self.state.metrics.record_failure(start.elapsed());
                return (StatusCode::BAD_REQUEST, format!("Failed to read request body: {}", e)).into_response();
            }
        };

        let mut backend_req = self
            .state
            .http_client
            .request(parts.method.clone(), url.as_str())
            .timeout(Duration::from_secs(self.state.config.proxy.timeout_seconds));

        // reqwest sets Host and Content-Length for the new target
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            if name.as_str() == "x-forwarded-for" {
                continue;
            }
            backend_req = backend_req.header(name, value);
        }
        if let Some(value) = Self::forwarded_for(&parts.headers, remote) {
            backend_req = backend_req.header("x-forwarded-for", value);
        } else if let Some(existing) = parts.headers.get("x-forwarded-for") {
            backend_req = backend_req.header("x-forwarded-for", existing);
        }

        let backend_response = match backend_req.body(body_bytes).send().await {
            Ok(resp) => resp,
            Err(e) => return self.fail(&selection, start, e),
        };

        let status = backend_response.status();
        self.state.metrics.record_success(start.elapsed());
        tracing::debug!(
            backend = %selection.backend,
            status = %status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Backend responded"
        );

        let mut response = Response::builder().status(status);
        for (name, value) in backend_response.headers().iter() {
            if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
                continue;
            }
            response = response.header(name, value);
        }

        match response.body(Body::from_stream(backend_response.bytes_stream())) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build response");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}
