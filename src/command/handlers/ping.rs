//! Ping handler

use super::{Handler, HandlerContext};
use crate::command::CommandResult;
use async_trait::async_trait;
use tracing::debug;

/// Answers `pong` naming the drone, ignoring the request body
pub struct Ping;

#[async_trait]
impl Handler for Ping {
    async fn handle(&self, ctx: &HandlerContext, _body: Vec<Vec<u8>>) -> CommandResult {
        debug!("  [PING] {} serving {}", ctx.drone_id, ctx.app);
        CommandResult::Completed {
            chunks: vec![format!("pong from {}", ctx.drone_id).into_bytes()],
        }
    }
}
