//! Protocol handlers installed on session channels
//!
//! A connection moves through handlers as it is authenticated and used:
//! a drone connection starts on [`HandshakeDispatch`] and switches its
//! channel to a [`ControlChannel`]; a client connection runs
//! [`AppDispatch`], which hands each request channel to a
//! [`StreamingDispatch`].

mod app;
mod control;
mod handshake;
mod streaming;

pub use app::AppDispatch;
pub use control::ControlChannel;
pub use handshake::HandshakeDispatch;
pub use streaming::{Direction, StreamingDispatch};

use crate::error::DispatchError;
use crate::session::Upstream;
use async_trait::async_trait;
use hive_shared::Payload;
use std::sync::Arc;

/// What the session does with a channel after a message was processed
pub enum Outcome {
    /// Keep routing the channel to the same dispatch
    Continue,
    /// Route the rest of the channel to another dispatch
    Switch(Arc<dyn Dispatch>),
    /// The stream on this channel is complete
    Finish,
    /// Drop the whole connection
    Close,
}

/// A protocol handler
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Human-readable name, used in logs
    fn name(&self) -> &str;

    /// Handle one message received on `upstream`'s channel
    async fn process(&self, payload: Payload, upstream: Upstream) -> Result<Outcome, DispatchError>;

    /// Transient root dispatches are removed from the session once they
    /// have switched a channel to their successor
    fn transient(&self) -> bool {
        false
    }

    /// The session ended while this dispatch was still installed
    async fn discard(&self, _reason: &str) {}
}
