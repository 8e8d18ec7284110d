use anyhow::Context;
use roster_node::config::Config;
use roster_node::notify::{EventKind, NetworkEvent, Priority, Subscribers};
use roster_node::session::{LogCommands, SessionTable};
use roster_node::{Node, NodeContext, RateLimitConfig, create_app};
use roster_store::RedisStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging
    #[cfg(debug_assertions)]
    let log_level = "debug";
    #[cfg(not(debug_assertions))]
    let log_level = "info";

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();
    tracing::info!("Starting roster node...");

    // Load configuration from environment variables or use defaults
    let config = Config::from_env();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let node_config = config.node_config()?;
    tracing::info!(
        "Configuration: node={}, port={}, store={}, heartbeat={}s, threshold={}s, sweep={}s",
        node_config.node_id,
        config.port,
        config.redis_url,
        config.heartbeat_interval.as_secs(),
        config.liveness_threshold,
        config.sweep_interval.as_secs()
    );
    tracing::info!(
        "Rate limits: lifecycle={}/sec (burst {}), query={}/sec (burst {})",
        config.rate_limit_lifecycle_per_sec,
        config.rate_limit_lifecycle_burst,
        config.rate_limit_query_per_sec,
        config.rate_limit_query_burst
    );

    let store = RedisStore::connect(&config.redis_url, config.redis_max_connections)
        .await
        .with_context(|| format!("store unreachable at {}", config.redis_url))?;
    let sessions = Arc::new(SessionTable::new());

    let node = Node::start(NodeContext {
        config: node_config,
        store: Arc::new(store),
        sessions: sessions.clone(),
        commands: Arc::new(LogCommands),
        subscribers: log_subscribers(),
    })
    .await?;

    let rate_limit = RateLimitConfig {
        lifecycle_per_sec: config.rate_limit_lifecycle_per_sec,
        lifecycle_burst: config.rate_limit_lifecycle_burst,
        query_per_sec: config.rate_limit_query_per_sec,
        query_burst: config.rate_limit_query_burst,
    };
    let app = create_app(
        node.clone(),
        sessions,
        config.request_body_limit,
        config.request_timeout,
        rate_limit,
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Unable to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutting down...");
    })
    .await;

    node.shutdown().await;
    served.context("HTTP server error")
}

/// Network notifications are only logged by the standalone binary.
fn log_subscribers() -> Subscribers {
    let mut subscribers = Subscribers::new();
    subscribers
        .subscribe(EventKind::Joined, Priority::Normal, |event| {
            if let NetworkEvent::Joined { player } = event {
                tracing::debug!(player = %player, "player joined the network");
            }
        })
        .subscribe(EventKind::Left, Priority::Normal, |event| {
            if let NetworkEvent::Left {
                player,
                previous_server,
            } = event
            {
                tracing::debug!(player = %player, ?previous_server, "player left the network");
            }
        })
        .subscribe(EventKind::ChangedServer, Priority::Normal, |event| {
            if let NetworkEvent::ChangedServer {
                player,
                previous,
                server,
            } = event
            {
                tracing::debug!(player = %player, ?previous, server = %server, "player changed server");
            }
        });
    subscribers
}
