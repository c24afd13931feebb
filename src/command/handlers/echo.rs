//! Echo handler

use super::{Handler, HandlerContext};
use crate::command::CommandResult;
use async_trait::async_trait;
use tracing::debug;

/// Streams the request chunks back unchanged
pub struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, ctx: &HandlerContext, body: Vec<Vec<u8>>) -> CommandResult {
        debug!("  [ECHO] '{}' echoes {} chunks on channel {}", ctx.event, body.len(), ctx.channel_id);
        CommandResult::Completed { chunks: body }
    }
}
