use anyhow::Context;
use clap::Parser;
use hive_overseer::isolate::{Isolate, ProcessIsolate};
use hive_overseer::listener::{serve_clients, serve_drones};
use hive_overseer::overseer::{Balancer, QueueBalancer, StaticBalancer, Watchdog};
use hive_overseer::{Overseer, OverseerConfig, TagPolicy};
use hive_shared::timeouts;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Drone pool overseer for a single application
#[derive(Parser, Debug)]
#[command(name = "hive-overseer", version)]
struct Args {
    /// Application name
    #[arg(long, env = "HIVE_APP", default_value = "app")]
    app: String,

    /// Drone executable started for each pool entry
    #[arg(long, env = "HIVE_DRONE", default_value = "target/debug/hive-drone")]
    drone: PathBuf,

    /// UNIX socket drones connect back to
    #[arg(long, env = "HIVE_ENDPOINT", default_value = "/tmp/hive-app.sock")]
    endpoint: PathBuf,

    /// Address clients connect to
    #[arg(long, env = "HIVE_LISTEN", default_value = "127.0.0.1:10053")]
    listen: String,

    /// Drones spawned at startup
    #[arg(long, default_value_t = 1)]
    pool_size: usize,

    /// Upper bound on pool entries
    #[arg(long, default_value_t = 10)]
    pool_limit: usize,

    /// Upper bound on requests waiting for a drone
    #[arg(long, default_value_t = 100)]
    queue_limit: usize,

    /// Requests a single drone serves at once
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    concurrency: u64,

    /// Spawn drones for waiting requests instead of keeping the pool size fixed
    #[arg(long)]
    autoscale: bool,

    /// Routing of tagged requests no drone has served yet
    #[arg(long, value_enum, default_value_t = TagPolicy::Strict)]
    tag_policy: TagPolicy,

    #[arg(long, default_value_t = timeouts::SPAWN_TIMEOUT_MS)]
    spawn_timeout_ms: u64,

    #[arg(long, default_value_t = timeouts::DESPAWN_TIMEOUT_MS)]
    despawn_timeout_ms: u64,

    #[arg(long, default_value_t = timeouts::HEARTBEAT_TIMEOUT_MS)]
    heartbeat_timeout_ms: u64,

    #[arg(long, default_value_t = timeouts::PENDING_TIMEOUT_MS)]
    pending_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> OverseerConfig {
        OverseerConfig {
            app: self.app.clone(),
            endpoint: self.endpoint.display().to_string(),
            spawn_timeout: Duration::from_millis(self.spawn_timeout_ms),
            despawn_timeout: Duration::from_millis(self.despawn_timeout_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            pending_timeout: Duration::from_millis(self.pending_timeout_ms),
            watchdog_interval: Duration::from_millis(timeouts::HEARTBEAT_INTERVAL_MS),
            pool_limit: self.pool_limit,
            queue_limit: self.queue_limit,
            drone_concurrency: self.concurrency as usize,
            tag_policy: self.tag_policy,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = args.config();

    info!("[MAIN] hive overseer starting for '{}'", config.app);
    info!("[MAIN]   drones: {} (endpoint {})", args.drone.display(), config.endpoint);
    info!("[MAIN]   clients: {}", args.listen);

    let isolate = Arc::new(ProcessIsolate::new(args.drone.clone()));
    isolate
        .spool()
        .await
        .with_context(|| format!("cannot use drone executable {}", args.drone.display()))?;

    let balancer: Box<dyn Balancer> = if args.autoscale {
        Box::new(QueueBalancer::new(config.pool_limit))
    } else {
        Box::new(StaticBalancer::new(args.pool_size))
    };

    // A stale socket from a previous run would make bind fail
    if args.endpoint.exists() {
        std::fs::remove_file(&args.endpoint)
            .with_context(|| format!("cannot remove stale socket {}", args.endpoint.display()))?;
    }
    let drones = UnixListener::bind(&args.endpoint)
        .with_context(|| format!("cannot bind {}", args.endpoint.display()))?;
    let clients = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("cannot bind {}", args.listen))?;

    let overseer = Overseer::new(config, isolate, balancer);

    let watchdog = Watchdog::new(&overseer);
    tokio::spawn(async move { watchdog.run().await });

    let spawned = overseer.request_spawn(args.pool_size).await;
    info!("[MAIN] spawned {} drones", spawned.len());

    let result = tokio::select! {
        result = serve_drones(drones, overseer.clone()) => result.context("drone listener failed"),
        result = serve_clients(clients, overseer.clone()) => result.context("client listener failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("[MAIN] interrupted");
            Ok(())
        }
    };
    if let Err(e) = &result {
        error!("[MAIN] {:#}", e);
    }

    if !overseer.shutdown().await {
        warn!("[MAIN] {} drones still present after shutdown", overseer.pool_size().await);
    }
    let _ = std::fs::remove_file(&args.endpoint);
    info!("[MAIN] overseer stopped");
    result
}
