//! Room Sync Server
//!
//! Minimal authoritative room server for multiplayer demo clients. Clients join a
//! room over WebSocket, push their position, and receive the full room state
//! whenever it changes.

mod config;
mod health;
mod room;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::ServerConfig;
use health::{HealthServer, ServerStats};
use room::RoomRegistry;
use server::WebSocketServer;

/// Room Sync Server
///
/// WebSocket room server that keeps player positions in sync
#[derive(Parser, Debug)]
#[command(name = "room-sync-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Port for the HTTP health endpoint (overrides the config file)
    #[arg(long)]
    health_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Resolve the effective configuration: file first, then flags
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if self.health_port.is_some() {
            config = config.with_health_port(self.health_port);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Room Sync Server v{}", env!("CARGO_PKG_VERSION"));

    let config = args.server_config()?;
    info!(
        "Serving room type '{}' (spawn radius {}, empty room timeout {:?})",
        config.room.room_type, config.room.spawn_radius, config.room.empty_room_timeout_secs
    );
    if config.room.max_abs_coordinate.is_none() {
        info!("Position updates are accepted without validation");
    }

    let stats = Arc::new(ServerStats::new());
    let registry = Arc::new(RoomRegistry::new(config.room.clone(), Arc::clone(&stats)));

    let mut health = None;
    if let Some(addr) = config.health_addr() {
        let mut health_server = HealthServer::new(addr);
        match health_server.start(Arc::clone(&stats)) {
            Ok(()) => health = Some(health_server),
            Err(e) => warn!("Health endpoint disabled: {}", e),
        }
    }

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config, registry));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    if let Some(mut health_server) = health {
        health_server.stop();
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.toml");
        fs::write(&path, "port = 3000\nbind = \"0.0.0.0\"\n").unwrap();

        let args = Args::parse_from([
            "room-sync-server",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "4000",
            "--health-port",
            "4001",
        ]);
        let config = args.server_config().unwrap();

        assert_eq!(config.socket_addr(), "0.0.0.0:4000");
        assert_eq!(config.health_addr(), Some("0.0.0.0:4001".to_string()));
    }

    #[test]
    fn test_defaults_without_flags() {
        let args = Args::parse_from(["room-sync-server"]);
        let config = args.server_config().unwrap();
        assert_eq!(config, ServerConfig::default());
    }
}
