//! Overseer configuration

use hive_shared::timeouts;
use std::time::Duration;

/// How a tagged enqueue is routed when no drone has served that tag yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TagPolicy {
    /// Only drones that already served the tag are eligible; otherwise the
    /// client gets a "not implemented" error
    #[default]
    Strict,
    /// Prefer a tagged drone, fall back to any drone and queue as usual
    Advisory,
}

/// Configuration for one application's overseer
#[derive(Debug, Clone)]
pub struct OverseerConfig {
    /// Application name, used in handler names and passed to drones
    pub app: String,
    /// Endpoint drones are told to connect back to
    pub endpoint: String,
    /// Time a spawned drone has to complete its handshake
    pub spawn_timeout: Duration,
    /// Time a draining drone has to acknowledge terminate
    pub despawn_timeout: Duration,
    /// Silence after which an attached drone is despawned
    pub heartbeat_timeout: Duration,
    /// Maximum time a request may wait for a drone
    pub pending_timeout: Duration,
    /// Period of the deadline watchdog
    pub watchdog_interval: Duration,
    /// Upper bound on pool entries
    pub pool_limit: usize,
    /// Upper bound on pending requests
    pub queue_limit: usize,
    /// Requests a single drone serves at once
    pub drone_concurrency: usize,
    /// Routing of tagged requests
    pub tag_policy: TagPolicy,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            app: "app".into(),
            endpoint: "/tmp/hive-app.sock".into(),
            spawn_timeout: Duration::from_millis(timeouts::SPAWN_TIMEOUT_MS),
            despawn_timeout: Duration::from_millis(timeouts::DESPAWN_TIMEOUT_MS),
            heartbeat_timeout: Duration::from_millis(timeouts::HEARTBEAT_TIMEOUT_MS),
            pending_timeout: Duration::from_millis(timeouts::PENDING_TIMEOUT_MS),
            watchdog_interval: Duration::from_millis(timeouts::HEARTBEAT_INTERVAL_MS),
            pool_limit: 10,
            queue_limit: 100,
            drone_concurrency: 1,
            tag_policy: TagPolicy::Strict,
        }
    }
}

impl OverseerConfig {
    /// Arguments handed to the isolation backend for drone `id`
    pub fn drone_args(&self, id: &str) -> Vec<String> {
        vec![
            "--uuid".into(),
            id.into(),
            "--endpoint".into(),
            self.endpoint.clone(),
            "--app".into(),
            self.app.clone(),
        ]
    }
}
