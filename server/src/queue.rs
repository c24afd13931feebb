//! Ordered message queue for one request stream
//!
//! The queue starts out buffering. Binding a sink flushes everything buffered
//! so far, in order, and from then on every append goes straight to the sink.
//! The flush and later appends are serialized by the same lock, so nothing
//! appended after the bind can overtake buffered messages.

use crate::error::{QueueError, SessionError};
use crate::session::Upstream;
use hive_shared::Payload;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::error;

/// Downstream receiver of a queue's messages
pub trait Sink: Send + Sync {
    fn deliver(&self, payload: Payload) -> Result<(), SessionError>;
}

impl Sink for Upstream {
    fn deliver(&self, payload: Payload) -> Result<(), SessionError> {
        self.send(payload)
    }
}

enum Mode<S> {
    Buffering(VecDeque<Payload>),
    Bound(S),
    Cancelled,
}

struct QueueState<S> {
    mode: Mode<S>,
    /// Set once `error` or `choke` has been appended
    terminated: bool,
}

/// Two-mode (buffering / bound) message queue
pub struct MessageQueue<S = Upstream> {
    state: Mutex<QueueState<S>>,
}

impl<S: Sink> Default for MessageQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Sink> MessageQueue<S> {
    /// Create a queue that buffers until bound
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                mode: Mode::Buffering(VecDeque::new()),
                terminated: false,
            }),
        }
    }

    /// Create a queue already bound to `sink`
    pub fn bound(sink: S) -> Self {
        Self {
            state: Mutex::new(QueueState {
                mode: Mode::Bound(sink),
                terminated: false,
            }),
        }
    }

    /// Append a message, forwarding it if a sink is bound
    pub async fn append(&self, payload: Payload) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if matches!(state.mode, Mode::Cancelled) {
            return Err(QueueError::Cancelled);
        }
        if state.terminated {
            error!(
                "[QUEUE] {:?} appended after the stream was closed",
                payload.message_type()
            );
            return Err(QueueError::Closed);
        }
        if payload.is_terminal() {
            state.terminated = true;
        }

        match &mut state.mode {
            Mode::Buffering(buffer) => {
                buffer.push_back(payload);
                Ok(())
            }
            Mode::Bound(sink) => Ok(sink.deliver(payload)?),
            Mode::Cancelled => Err(QueueError::Cancelled),
        }
    }

    /// Bind the sink and flush the buffer into it; returns the number of
    /// messages flushed
    pub async fn bind(&self, sink: S) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let buffered = match std::mem::replace(&mut state.mode, Mode::Cancelled) {
            Mode::Buffering(buffer) => buffer,
            other => {
                let err = match &other {
                    Mode::Bound(_) => QueueError::AlreadyBound,
                    _ => QueueError::Cancelled,
                };
                state.mode = other;
                return Err(err);
            }
        };

        let flushed = buffered.len();
        for payload in buffered {
            // A failed sink leaves the queue cancelled
            sink.deliver(payload)?;
        }
        state.mode = Mode::Bound(sink);
        Ok(flushed)
    }

    /// Cancel the queue: drop buffered messages, refuse binds and appends.
    /// Returns false if it was already cancelled.
    ///
    /// A cancelled queue is not terminated: the peer may still be sending
    /// the rest of its stream, and those appends get [`QueueError::Cancelled`].
    pub async fn cancel(&self) -> bool {
        let mut state = self.state.lock().await;
        !matches!(
            std::mem::replace(&mut state.mode, Mode::Cancelled),
            Mode::Cancelled
        )
    }

    /// Whether a terminal message was appended or the queue was cancelled
    pub async fn is_closed(&self) -> bool {
        let state = self.state.lock().await;
        state.terminated || matches!(state.mode, Mode::Cancelled)
    }

    pub async fn is_bound(&self) -> bool {
        matches!(self.state.lock().await.mode, Mode::Bound(_))
    }

    /// Messages waiting for a sink
    pub async fn buffered(&self) -> usize {
        match &self.state.lock().await.mode {
            Mode::Buffering(buffer) => buffer.len(),
            _ => 0,
        }
    }
}
