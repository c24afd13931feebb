mod command;
mod connection;
mod transport;

use anyhow::Result;
use clap::Parser;
use command::CommandExecutor;
use connection::{ConnectionConfig, ConnectionManager, Termination};
use hive_shared::timeouts;
use std::sync::Arc;
use std::time::Duration;
use transport::{Endpoint, TcpConnector, TransportConnector, UnixConnector};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Drone process serving one application's requests for an overseer
#[derive(Parser, Debug)]
#[command(name = "hive-drone", version)]
struct Args {
    /// Identity assigned by the overseer
    #[arg(long)]
    uuid: String,

    /// Overseer endpoint: a UNIX socket path or tcp://host:port
    #[arg(long)]
    endpoint: String,

    /// Application this drone serves
    #[arg(long, default_value = "app")]
    app: String,

    #[arg(long, default_value_t = timeouts::HEARTBEAT_INTERVAL_MS)]
    heartbeat_interval_ms: u64,

    /// How long to keep reconnecting after losing the overseer
    #[arg(long, default_value_t = timeouts::SPAWN_TIMEOUT_MS)]
    reattach_window_ms: u64,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let endpoint = Endpoint::parse(&args.endpoint);

    info!("Drone starting: {}", args.uuid);
    info!("  App: {}", args.app);
    info!("  Overseer: {}", endpoint);

    let config = ConnectionConfig {
        drone_id: args.uuid.clone(),
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        reattach_window: Duration::from_millis(args.reattach_window_ms),
        ..Default::default()
    };
    let executor = Arc::new(CommandExecutor::with_builtins(args.uuid.clone(), args.app.clone()));
    info!("  Events: {}", executor.events().join(", "));

    let manager = ConnectionManager::new(config, executor);

    let result = match endpoint {
        Endpoint::Tcp(address) => serve(&manager, TcpConnector::new(address)).await,
        Endpoint::Unix(path) => serve(&manager, UnixConnector::new(path)).await,
    };

    match result {
        Ok(termination) => {
            info!(
                "Drone {} terminated: {:?} {}",
                manager.drone_id(),
                termination.code,
                termination.reason
            );
        }
        Err(e) => {
            error!("Drone {} stopped: {:#}", manager.drone_id(), e);
            std::process::exit(1);
        }
    }
}

async fn serve<C: TransportConnector>(manager: &ConnectionManager, connector: C) -> Result<Termination> {
    tokio::select! {
        result = manager.run(&connector) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted before the overseer sent terminate");
            Err(anyhow::anyhow!("interrupted"))
        }
    }
}
