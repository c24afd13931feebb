//! App dispatch, accepts client `enqueue` requests and hands them to the
//! overseer

use super::{Dispatch, Outcome};
use crate::error::DispatchError;
use crate::overseer::Overseer;
use crate::session::Upstream;
use async_trait::async_trait;
use hive_shared::{error_code, Payload};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AppDispatch {
    name: String,
    overseer: Arc<Overseer>,
}

impl AppDispatch {
    pub fn new(overseer: Arc<Overseer>) -> Self {
        Self {
            name: format!("app/dispatch/{}", overseer.name()),
            overseer,
        }
    }
}

#[async_trait]
impl Dispatch for AppDispatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, payload: Payload, upstream: Upstream) -> Result<Outcome, DispatchError> {
        let Payload::Enqueue(enqueue) = payload else {
            warn!(
                "[APP] {:?} on channel {} without enqueue",
                payload.message_type(),
                upstream.channel_id()
            );
            let _ = upstream.send(Payload::error(
                error_code::PROTOCOL_VIOLATION,
                "expected enqueue",
            ));
            return Ok(Outcome::Finish);
        };

        if enqueue.tag.is_empty() {
            debug!("[APP] processing enqueue '{}' event", enqueue.event);
        } else {
            debug!(
                "[APP] processing enqueue '{}' event with tag '{}'",
                enqueue.event, enqueue.tag
            );
        }

        match self
            .overseer
            .enqueue(upstream.clone(), &enqueue.event, &enqueue.tag)
            .await
        {
            Ok(streaming) => Ok(Outcome::Switch(streaming)),
            Err(e) => {
                debug!("[APP] rejecting '{}': {}", enqueue.event, e);
                let _ = upstream.send(Payload::error(e.code(), e.to_string()));
                Ok(Outcome::Finish)
            }
        }
    }
}
