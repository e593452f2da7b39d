use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use chatroom_server::chat::log::SqliteMessageLog;
use chatroom_server::config::{generate_config_template, Cli, Config};
use chatroom_server::identity::SqliteProfiles;
use chatroom_server::{db, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load(&cli)?;

    // Initialize tracing/logging
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatroom_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter()).init();
    }

    tracing::info!("Chatroom server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    tracing::info!(
        probe_interval_secs = config.presence.probe_interval_secs,
        liveness_timeout_secs = config.presence.liveness_timeout_secs,
        identity_policy = ?config.presence.identity_policy,
        "Presence settings loaded"
    );

    let app_state = state::AppState::new(
        config.presence.clone(),
        Arc::new(SqliteProfiles::new(db.clone())),
        Arc::new(SqliteMessageLog::new(db)),
    );

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
