//! Built-in event handlers

mod echo;
mod ping;
mod uppercase;

pub use echo::Echo;
pub use ping::Ping;
pub use uppercase::Uppercase;

use crate::command::CommandResult;
use async_trait::async_trait;

/// Context passed to event handlers
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub drone_id: String,
    pub app: String,
    pub event: String,
    pub channel_id: u64,
}

/// Code run for one invoked event
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve one request. `body` holds the request chunks in arrival order.
    async fn handle(&self, ctx: &HandlerContext, body: Vec<Vec<u8>>) -> CommandResult;
}
