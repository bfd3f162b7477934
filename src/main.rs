use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reef_server::aquarium::manager::AquariumManager;
use reef_server::assets::SpriteAssets;
use reef_server::config::ServerConfig;
use reef_server::metrics::{self, Metrics};
use reef_server::net::transport::TelnetServer;

/// Time left for session writers to flush their teardown on exit
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Reef Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {}:{}, tick every {:?}{}",
        config.bind_address,
        config.port,
        config.tick_interval(),
        if config.debug { " (debug)" } else { "" }
    );

    let assets = SpriteAssets::load(&config.asset_dir)
        .with_context(|| format!("loading sprites from {}", config.asset_dir.display()))?;

    let metrics = Arc::new(Metrics::new());
    let status_addr = SocketAddr::new(config.bind_address, config.status_port);
    let status_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::start_status_server(status_metrics, status_addr).await {
            error!("Status server error: {}", e);
        }
    });

    let manager = AquariumManager::new(config.engine(), Arc::new(assets), metrics);
    let server = TelnetServer::new(SocketAddr::new(config.bind_address, config.port), manager.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    manager.shutdown().await;
    tokio::time::sleep(SHUTDOWN_FLUSH).await;
    info!("Server stopped");

    Ok(())
}
