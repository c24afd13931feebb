//! Control channel for a single drone
//!
//! Receives heartbeats and terminate acknowledgements, pushes terminate.
//! A drone shuts itself down after receiving terminate, even when it asked
//! for the disconnect itself.

use super::{Dispatch, Outcome};
use crate::error::{DispatchError, SessionError};
use crate::overseer::Overseer;
use crate::session::Upstream;
use async_trait::async_trait;
use hive_shared::{Payload, TerminateCode};
use std::sync::Weak;
use tracing::{debug, info, warn};

pub struct ControlChannel {
    name: String,
    drone_id: String,
    upstream: Upstream,
    overseer: Weak<Overseer>,
}

impl ControlChannel {
    pub fn new(app: &str, drone_id: &str, upstream: Upstream, overseer: Weak<Overseer>) -> Self {
        Self {
            name: format!("{}/control", app),
            drone_id: drone_id.to_string(),
            upstream,
            overseer,
        }
    }

    pub fn drone_id(&self) -> &str {
        &self.drone_id
    }

    /// Id of the session this channel is bound to
    pub fn session_id(&self) -> u64 {
        self.upstream.session().id()
    }

    /// Push a terminate instruction down to the drone
    pub fn terminate(&self, code: TerminateCode, reason: &str) -> Result<(), SessionError> {
        debug!("[CONTROL] -> terminate {} ({})", self.drone_id, reason);
        self.upstream.send(Payload::terminate(code, reason))
    }

    /// Drop the drone's connection
    pub fn disconnect(&self) {
        self.upstream.session().close();
    }
}

#[async_trait]
impl Dispatch for ControlChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, payload: Payload, _upstream: Upstream) -> Result<Outcome, DispatchError> {
        let overseer = self.overseer.upgrade().ok_or(DispatchError::OverseerGone)?;

        match payload {
            Payload::Heartbeat(_) => {
                debug!("[CONTROL] <- heartbeat {}", self.drone_id);
                overseer.heartbeat(&self.drone_id).await;
                Ok(Outcome::Continue)
            }
            Payload::Terminate(terminate) => {
                info!(
                    "[CONTROL] <- terminate {} code={:?} reason={}",
                    self.drone_id,
                    terminate.code(),
                    terminate.reason
                );
                overseer.terminated(&self.drone_id).await;
                Ok(Outcome::Continue)
            }
            other => {
                warn!(
                    "[CONTROL] {} sent unexpected {:?}",
                    self.drone_id,
                    other.message_type()
                );
                Err(DispatchError::Unexpected {
                    dispatch: self.name.clone(),
                    message: other.message_type(),
                })
            }
        }
    }

    async fn discard(&self, reason: &str) {
        if let Some(overseer) = self.overseer.upgrade() {
            overseer.session_lost(&self.drone_id, self.session_id(), reason).await;
        }
    }
}
