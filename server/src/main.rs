use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use agora_server::config::{generate_config_template, Config};
use agora_server::store::sqlite::SqliteStore;
use agora_server::store::Store;
use agora_server::{db, routes, state, Hub};

/// How long shutdown waits for connection actors to detach.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agora_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(env_filter()).init();
    }

    tracing::info!("Agora server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(db));

    tracing::info!(
        send_queue_depth = config.messaging.send_queue_depth,
        queue_capacity = config.messaging.queue_capacity,
        away_timeout_secs = config.messaging.away_timeout_secs,
        offline_grace_secs = config.messaging.offline_grace_secs,
        "Messaging core configured"
    );

    let hub = Hub::new(store, config.messaging.clone());
    hub.spawn_background_tasks();

    let app = routes::build_router(state::AppState::new(hub.clone()));

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(hub.clone()))
    .await?;

    if hub.wait_for_connections(SHUTDOWN_DEADLINE).await {
        tracing::info!("All connections detached");
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl-C and cancel every open connection so their actors can
/// hand undelivered frames back to the queue.
async fn shutdown_signal(hub: Hub) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!(
        connections = hub.registry.total_connections(),
        "Shutting down"
    );
    hub.shutdown();
}
