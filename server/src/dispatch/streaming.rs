//! Per-request streaming handler
//!
//! Each enqueued request gets two of these. The request side carries what
//! the client streams toward the drone and buffers until a drone is bound.
//! The response side carries what the drone streams back and is bound to the
//! client from the start. Both go through a [`MessageQueue`], so each
//! direction is `chunk*` followed by at most one `error` or `choke`.

use super::{Dispatch, Outcome};
use crate::error::{DispatchError, QueueError};
use crate::overseer::Overseer;
use crate::queue::MessageQueue;
use crate::session::Upstream;
use async_trait::async_trait;
use hive_shared::{error_code, Payload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, Weak};
use tracing::debug;

/// Which way a streaming dispatch relays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to drone, buffered until a drone is bound
    Request,
    /// Drone to client, bound to the client upstream on creation
    Response,
}

pub struct StreamingDispatch {
    name: String,
    request_id: u64,
    direction: Direction,
    queue: MessageQueue,
    drone: OnceLock<String>,
    completed: AtomicBool,
    overseer: Weak<Overseer>,
}

impl StreamingDispatch {
    /// Client-to-drone side of request `request_id`
    pub fn request(app: &str, request_id: u64, overseer: Weak<Overseer>) -> Self {
        Self::with_queue(app, request_id, Direction::Request, MessageQueue::new(), overseer)
    }

    /// Drone-to-client side of request `request_id`
    pub fn response(app: &str, request_id: u64, client: Upstream, overseer: Weak<Overseer>) -> Self {
        Self::with_queue(
            app,
            request_id,
            Direction::Response,
            MessageQueue::bound(client),
            overseer,
        )
    }

    fn with_queue(
        app: &str,
        request_id: u64,
        direction: Direction,
        queue: MessageQueue,
        overseer: Weak<Overseer>,
    ) -> Self {
        let side = match direction {
            Direction::Request => "request",
            Direction::Response => "response",
        };
        Self {
            name: format!("{}/streaming/{}/{}", app, request_id, side),
            request_id,
            direction,
            queue,
            drone: OnceLock::new(),
            completed: AtomicBool::new(false),
            overseer,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Drone serving this request, once bound
    pub fn drone(&self) -> Option<&str> {
        self.drone.get().map(String::as_str)
    }

    /// Record the drone serving this request
    pub fn assign(&self, drone_id: &str) {
        let _ = self.drone.set(drone_id.to_string());
    }

    pub async fn chunk(&self, data: Vec<u8>) -> Result<(), QueueError> {
        self.queue.append(Payload::chunk(data)).await
    }

    pub async fn error(&self, code: i32, reason: &str) -> Result<(), QueueError> {
        self.queue.append(Payload::error(code, reason)).await
    }

    pub async fn choke(&self) -> Result<(), QueueError> {
        self.queue.append(Payload::choke()).await
    }

    /// Bind the downstream sink, flushing everything buffered so far
    pub async fn bind(&self, sink: Upstream) -> Result<usize, QueueError> {
        self.queue.bind(sink).await
    }

    /// Stop relaying; buffered messages are dropped
    pub async fn cancel(&self) -> bool {
        self.queue.cancel().await
    }

    pub async fn is_closed(&self) -> bool {
        self.queue.is_closed().await
    }

    pub async fn is_bound(&self) -> bool {
        self.queue.is_bound().await
    }

    /// The drone finished with this request; frees its slot once
    async fn complete(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (Some(drone), Some(overseer)) = (self.drone(), self.overseer.upgrade()) {
            overseer.release(drone, self.request_id).await;
        }
    }
}

#[async_trait]
impl Dispatch for StreamingDispatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, payload: Payload, _upstream: Upstream) -> Result<Outcome, DispatchError> {
        if !matches!(
            payload,
            Payload::Chunk(_) | Payload::Error(_) | Payload::Choke(_)
        ) {
            return Err(DispatchError::Unexpected {
                dispatch: self.name.clone(),
                message: payload.message_type(),
            });
        }

        let terminal = payload.is_terminal();
        match self.queue.append(payload).await {
            Ok(()) => {}
            // The other end is gone; keep draining the stream without relaying
            Err(QueueError::Cancelled) | Err(QueueError::Sink(_)) => {
                debug!("[STREAM] {} dropping message, peer gone", self.name);
            }
            Err(e) => return Err(e.into()),
        }

        if !terminal {
            return Ok(Outcome::Continue);
        }
        if self.direction == Direction::Response {
            self.complete().await;
        }
        Ok(Outcome::Finish)
    }

    async fn discard(&self, reason: &str) {
        match self.direction {
            Direction::Request => {
                // Client went away. A bound drone still waiting for the
                // request body is told so; otherwise the request is dropped
                // from the pending set.
                if self.queue.is_bound().await && !self.queue.is_closed().await {
                    let _ = self.error(error_code::CANCELLED, "client disconnected").await;
                }
                self.cancel().await;
                if let Some(overseer) = self.overseer.upgrade() {
                    overseer.cancel(self.request_id).await;
                }
            }
            Direction::Response => {
                if !self.queue.is_closed().await {
                    let _ = self
                        .error(error_code::DRONE_LOST, &format!("drone lost: {}", reason))
                        .await;
                }
                self.complete().await;
            }
        }
    }
}
