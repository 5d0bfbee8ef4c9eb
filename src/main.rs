//! pingtrail - network latency monitor.

use pingtrail::config::{AppConfig, ServerConfig};
use pingtrail::engine::Engine;
use pingtrail::probe::IcmpProbe;
use pingtrail::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingtrail=info".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting pingtrail on port {}...", cfg.http_port);
    tracing::info!("Using config at {:?}", cfg.config_path);

    let app_config = AppConfig::load(&cfg.config_path)?;

    // Create engine
    let engine = Arc::new(Engine::new(
        app_config,
        Arc::new(IcmpProbe::new()),
        &cfg.log_dir,
        Some(cfg.config_path.clone()),
    )?);

    // Start probing
    engine.start().await?;

    // Serve until interrupted
    let server = Server::new(cfg, engine.clone());
    server.start(shutdown_signal()).await?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
