//! Handshake handler: the only handler an unauthenticated drone can reach

use super::{Dispatch, Outcome};
use crate::error::DispatchError;
use crate::overseer::Overseer;
use crate::session::Upstream;
use async_trait::async_trait;
use hive_shared::Payload;
use std::sync::Weak;
use tracing::debug;

/// Verifies a connecting drone's identity against the pool
pub struct HandshakeDispatch {
    name: String,
    overseer: Weak<Overseer>,
}

impl HandshakeDispatch {
    pub fn new(app: &str, overseer: Weak<Overseer>) -> Self {
        Self {
            name: format!("{}/handshake", app),
            overseer,
        }
    }
}

#[async_trait]
impl Dispatch for HandshakeDispatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, payload: Payload, upstream: Upstream) -> Result<Outcome, DispatchError> {
        let Payload::Handshake(handshake) = payload else {
            // No reply: an unauthenticated peer is not trusted to speak the protocol
            debug!(
                "[HANDSHAKE] {:?} before handshake from {}",
                payload.message_type(),
                upstream.session().peer()
            );
            return Ok(Outcome::Close);
        };

        let overseer = self.overseer.upgrade().ok_or(DispatchError::OverseerGone)?;
        match overseer.handshake(&handshake.peer_id, upstream).await {
            Some(control) => Ok(Outcome::Switch(control)),
            None => Ok(Outcome::Close),
        }
    }

    fn transient(&self) -> bool {
        true
    }
}
