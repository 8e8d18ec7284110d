pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod helpers;
pub mod liveness;
pub mod node;
pub mod notify;
pub mod protocol;
pub mod records;
mod routes;
pub mod session;
pub mod sweep;
pub mod validation;

pub use node::{LoginDecision, Node, NodeContext};

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use session::SessionTable;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

pub struct AppState {
    pub node: Node,
    pub sessions: Arc<SessionTable>,
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per second for lifecycle endpoints (/login, /postlogin, /switch, /disconnect)
    pub lifecycle_per_sec: u64,
    /// Burst size for lifecycle endpoints
    pub lifecycle_burst: u32,
    /// Requests per second for query and command endpoints
    pub query_per_sec: u64,
    /// Burst size for query and command endpoints
    pub query_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            lifecycle_per_sec: 100,
            lifecycle_burst: 200,
            query_per_sec: 20,
            query_burst: 40,
        }
    }
}

/// Create the application router for a started node
pub fn create_app(
    node: Node,
    sessions: Arc<SessionTable>,
    request_body_limit: usize,
    request_timeout: Duration,
    rate_limit: RateLimitConfig,
) -> Router {
    let state = Arc::new(AppState { node, sessions });

    // Lenient rate limit for lifecycle endpoints - a proxy restart reconnects everyone at once
    let lifecycle_governor = GovernorConfigBuilder::default()
        .per_second(rate_limit.lifecycle_per_sec.max(1))
        .burst_size(rate_limit.lifecycle_burst.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("rate limit values are non-zero");

    let query_governor = GovernorConfigBuilder::default()
        .per_second(rate_limit.query_per_sec.max(1))
        .burst_size(rate_limit.query_burst.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("rate limit values are non-zero");

    let lifecycle_routes = Router::new()
        .route("/login", post(routes::login))
        .route("/postlogin", post(routes::post_login))
        .route("/switch", post(routes::switch))
        .route("/disconnect", post(routes::disconnect))
        .layer(GovernorLayer::new(lifecycle_governor));

    let query_routes = Router::new()
        .route("/players", get(routes::players))
        .route("/players/count", get(routes::player_count))
        .route("/players/{name}", get(routes::player))
        .route("/servers/{server}/players", get(routes::server_players))
        .route("/proxies", get(routes::proxies))
        .route("/proxies/{id}/players", get(routes::proxy_players))
        .route("/proxies/{id}/command", post(routes::proxy_command))
        .layer(GovernorLayer::new(query_governor));

    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .merge(lifecycle_routes)
        .merge(query_routes)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(RequestBodyLimitLayer::new(request_body_limit))
        .with_state(state)
}
