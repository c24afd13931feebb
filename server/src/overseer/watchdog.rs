//! Deadline watchdog for the drone pool

use super::Overseer;
use std::sync::{Arc, Weak};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

/// Periodically enforces heartbeat deadlines and pending request expiry
pub struct Watchdog {
    overseer: Weak<Overseer>,
    check_interval: Duration,
}

impl Watchdog {
    pub fn new(overseer: &Arc<Overseer>) -> Self {
        Self {
            overseer: Arc::downgrade(overseer),
            check_interval: overseer
                .config()
                .watchdog_interval
                .max(Duration::from_millis(10)),
        }
    }

    /// Run until the overseer is dropped
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(overseer) = self.overseer.upgrade() else {
                debug!("[WATCHDOG] overseer gone, stopping");
                break;
            };
            overseer.check_deadlines().await;
        }
    }
}
