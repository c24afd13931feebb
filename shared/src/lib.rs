//! Hive Shared Protocol Types
//!
//! This crate provides the wire messages, framing codec and drone lifecycle
//! state machine shared by the overseer, the drones it spawns and the
//! clients enqueueing work.

pub mod codec;
pub mod proto;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use proto::envelope::Payload;
pub use proto::*;

/// Protocol version spoken by every handler in this crate
pub const PROTOCOL_VERSION: u32 = 1;

/// Channel a drone opens to carry its handshake and, once accepted, the
/// control protocol
pub const CONTROL_CHANNEL: u64 = 1;

/// Channels opened by the overseer start here so they never collide with
/// channels opened by the peer
pub const OUTBOUND_CHANNEL_BASE: u64 = 1 << 32;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters for the pool
pub mod timeouts {
    /// Heartbeat interval a drone is expected to keep
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

    /// Silence after which an attached drone is considered dead
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 10000;

    /// Time a spawned drone has to complete its handshake
    pub const SPAWN_TIMEOUT_MS: u64 = 10000;

    /// Time a draining drone has to acknowledge terminate
    pub const DESPAWN_TIMEOUT_MS: u64 = 5000;

    /// Maximum age of a request waiting for a drone
    pub const PENDING_TIMEOUT_MS: u64 = 30000;
}

/// Numeric codes carried by `error` messages sent to clients and drones
pub mod error_code {
    /// The drone spawned for the request never completed its handshake
    pub const SPAWN_TIMEOUT: i32 = 1;
    /// The isolation backend could not start a drone
    pub const SPAWN_FAILED: i32 = 2;
    /// Too many requests are already waiting
    pub const QUEUE_FULL: i32 = 3;
    /// The request waited too long for a drone
    pub const REQUEST_TIMEOUT: i32 = 4;
    /// Routing for this request is not implemented
    pub const NOT_IMPLEMENTED: i32 = 5;
    /// The drone serving the request disconnected
    pub const DRONE_LOST: i32 = 6;
    /// The drone serving the request was despawned
    pub const DRONE_TERMINATED: i32 = 7;
    /// The peer sent a message the current handler does not accept
    pub const PROTOCOL_VIOLATION: i32 = 8;
    /// The client went away before the request finished
    pub const CANCELLED: i32 = 9;
    /// The overseer stopped accepting work
    pub const SHUTTING_DOWN: i32 = 10;
}

impl Header {
    /// Create a new header for the given channel and message type
    pub fn new(channel_id: u64, msg_type: MessageType) -> Self {
        Self {
            channel_id,
            msg_type: msg_type.into(),
            timestamp_ms: now_ms(),
        }
    }
}

impl Envelope {
    /// Wrap a payload for the given channel, deriving the header type from it
    pub fn new(channel_id: u64, payload: Payload) -> Self {
        Self {
            header: Some(Header::new(channel_id, payload.message_type())),
            payload: Some(payload),
        }
    }

    /// Channel of this envelope, if it carries a header
    pub fn channel_id(&self) -> Option<u64> {
        self.header.as_ref().map(|h| h.channel_id)
    }
}

impl Payload {
    pub fn handshake(peer_id: impl Into<String>) -> Self {
        Payload::Handshake(Handshake {
            peer_id: peer_id.into(),
        })
    }

    pub fn heartbeat() -> Self {
        Payload::Heartbeat(Heartbeat {})
    }

    pub fn terminate(code: TerminateCode, reason: impl Into<String>) -> Self {
        Payload::Terminate(Terminate {
            code: code.into(),
            reason: reason.into(),
        })
    }

    pub fn enqueue(event: impl Into<String>, tag: impl Into<String>) -> Self {
        Payload::Enqueue(Enqueue {
            event: event.into(),
            tag: tag.into(),
        })
    }

    pub fn invoke(event: impl Into<String>) -> Self {
        Payload::Invoke(Invoke {
            event: event.into(),
        })
    }

    pub fn chunk(data: impl Into<Vec<u8>>) -> Self {
        Payload::Chunk(Chunk { data: data.into() })
    }

    pub fn error(code: i32, reason: impl Into<String>) -> Self {
        Payload::Error(StreamError {
            code,
            reason: reason.into(),
        })
    }

    pub fn choke() -> Self {
        Payload::Choke(Choke {})
    }

    /// Header discriminator matching this payload
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Handshake(_) => MessageType::MsgHandshake,
            Payload::Heartbeat(_) => MessageType::MsgHeartbeat,
            Payload::Terminate(_) => MessageType::MsgTerminate,
            Payload::Enqueue(_) => MessageType::MsgEnqueue,
            Payload::Invoke(_) => MessageType::MsgInvoke,
            Payload::Chunk(_) => MessageType::MsgChunk,
            Payload::Error(_) => MessageType::MsgError,
            Payload::Choke(_) => MessageType::MsgChoke,
        }
    }

    /// Whether this payload ends a stream (`error` or `choke`)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Payload::Error(_) | Payload::Choke(_))
    }
}
