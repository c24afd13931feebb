//! Uppercase handler

use super::{Handler, HandlerContext};
use crate::command::{CommandResult, HANDLER_FAILED};
use async_trait::async_trait;

/// Uppercases the whole request body and answers it as a single chunk
///
/// The body is joined before conversion so a character split across two
/// chunks is still converted correctly. Non UTF-8 input fails the request.
pub struct Uppercase;

#[async_trait]
impl Handler for Uppercase {
    async fn handle(&self, _ctx: &HandlerContext, body: Vec<Vec<u8>>) -> CommandResult {
        match String::from_utf8(body.concat()) {
            Ok(text) => CommandResult::Completed {
                chunks: vec![text.to_uppercase().into_bytes()],
            },
            Err(e) => CommandResult::Failed {
                code: HANDLER_FAILED,
                message: format!("request body is not UTF-8: {}", e),
            },
        }
    }
}
