//! Command executor - looks up and runs the handler for an invoked event

use super::handlers::{Echo, Handler, HandlerContext, Ping, Uppercase};
use hive_shared::{error_code, Payload};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error code for a handler that ran and failed
pub const HANDLER_FAILED: i32 = 100;

/// Result of running a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Handler finished; each entry becomes one `chunk`
    Completed { chunks: Vec<Vec<u8>> },
    /// Handler ran but could not serve the request
    Failed { code: i32, message: String },
    /// No handler serves the event
    Rejected { message: String },
}

/// Executes invoked events on this drone
pub struct CommandExecutor {
    drone_id: String,
    app: String,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl CommandExecutor {
    /// Create an executor with no handlers
    pub fn new(drone_id: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            drone_id: drone_id.into(),
            app: app.into(),
            handlers: HashMap::new(),
        }
    }

    /// Create an executor serving `echo`, `ping` and `uppercase`
    pub fn with_builtins(drone_id: impl Into<String>, app: impl Into<String>) -> Self {
        let mut executor = Self::new(drone_id, app);
        executor.register("echo", Arc::new(Echo));
        executor.register("ping", Arc::new(Ping));
        executor.register("uppercase", Arc::new(Uppercase));
        executor
    }

    /// Register `handler` for `event`, replacing any previous one
    pub fn register(&mut self, event: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(event.into(), handler);
    }

    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        events.sort_unstable();
        events
    }

    /// Run `event` over `body` and return the result
    pub async fn run(&self, channel_id: u64, event: &str, body: Vec<Vec<u8>>) -> CommandResult {
        let Some(handler) = self.handlers.get(event) else {
            return CommandResult::Rejected {
                message: format!("no handler for event '{}'", event),
            };
        };

        let ctx = HandlerContext {
            drone_id: self.drone_id.clone(),
            app: self.app.clone(),
            event: event.to_string(),
            channel_id,
        };
        handler.handle(&ctx, body).await
    }

    /// Run `event` and return the payloads answering it, terminal last
    pub async fn execute(&self, channel_id: u64, event: &str, body: Vec<Vec<u8>>) -> Vec<Payload> {
        let started = Instant::now();
        info!("[EXECUTOR] channel {} runs '{}'", channel_id, event);

        let result = self.run(channel_id, event, body).await;
        let elapsed = started.elapsed();

        match result {
            CommandResult::Completed { chunks } => {
                debug!(
                    "[EXECUTOR] '{}' completed with {} chunks in {:?}",
                    event,
                    chunks.len(),
                    elapsed
                );
                let mut payloads: Vec<Payload> = chunks.into_iter().map(Payload::chunk).collect();
                payloads.push(Payload::choke());
                payloads
            }
            CommandResult::Failed { code, message } => {
                warn!("[EXECUTOR] '{}' failed: {}", event, message);
                vec![Payload::error(code, message)]
            }
            CommandResult::Rejected { message } => {
                warn!("[EXECUTOR] '{}' rejected: {}", event, message);
                vec![Payload::error(error_code::NOT_IMPLEMENTED, message)]
            }
        }
    }
}
