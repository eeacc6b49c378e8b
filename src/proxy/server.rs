//! Main proxy server implementation

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use super::handler::ProxyHandler;
use super::rewrite::PathRewriter;
use crate::backends::LoadBalancer;
use crate::config::AppConfig;
use crate::stats::{GatewayMetrics, MetricsSnapshot};

/// Shared state for the proxy
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<AppConfig>,
    pub http_client: reqwest::Client,
    pub balancer: Arc<dyn LoadBalancer>,
    pub metrics: Arc<GatewayMetrics>,
    pub rewriter: Arc<PathRewriter>,
}

impl ProxyState {
    pub fn new(config: AppConfig, balancer: Arc<dyn LoadBalancer>) -> Result<Self, Box<dyn std::error::Error>> {
        let http_client = build_http_client(&config)?;
        let rewriter = PathRewriter::new(config.proxy.strip_prefix.as_deref())?;
        Ok(Self {
            config: Arc::new(config),
            http_client,
            balancer,
            metrics: Arc::new(GatewayMetrics::new()),
            rewriter: Arc::new(rewriter),
        })
    }
}

/// Build the pooled client used for every backend. Redirects are handed
/// back to the caller untouched.
fn build_http_client(config: &AppConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.proxy.timeout_seconds))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Gateway routes plus the catch-all proxy
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/gateway/health", get(health_handler))
        .route("/gateway/stats", get(stats_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the proxy server
pub async fn run_server(config: AppConfig, balancer: Arc<dyn LoadBalancer>) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = ProxyState::new(config, balancer)?;
    let strategy = state.balancer.strategy_name();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gateway-proxy listening on {}", addr);
    tracing::info!(strategy, "Balancing requests");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    strategy: &'static str,
    backends: Vec<String>,
    #[serde(flatten)]
    metrics: MetricsSnapshot,
}

async fn stats_handler(State(state): State<ProxyState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        strategy: state.balancer.strategy_name(),
        backends: state.balancer.all_nodes(),
        metrics: state.metrics.snapshot(),
    })
}

/// Everything outside `/gateway/*` is forwarded
async fn proxy_handler(State(state): State<ProxyState>, req: axum::extract::Request) -> axum::response::Response {
    let handler = ProxyHandler::new(state);
    handler.handle(req).await
}
