//! Protocol messages, version 1
//!
//! The messages are declared with prost derive macros rather than generated
//! from a `.proto` file, so the crate builds without `protoc`. Field tags are
//! part of the wire contract and must never be reused.

use prost::{Enumeration, Message};

/// Discriminator carried in every header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum MessageType {
    MsgUnknown = 0,
    MsgHandshake = 1,
    MsgHeartbeat = 2,
    MsgTerminate = 3,
    MsgEnqueue = 4,
    MsgInvoke = 5,
    MsgChunk = 6,
    MsgError = 7,
    MsgChoke = 8,
}

/// Reason attached to a terminate message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum TerminateCode {
    TerminateUnknown = 0,
    TerminateNormal = 1,
    TerminateAbnormal = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct Header {
    /// Stream this message belongs to
    #[prost(uint64, tag = "1")]
    pub channel_id: u64,

    #[prost(enumeration = "MessageType", tag = "2")]
    pub msg_type: i32,

    #[prost(uint64, tag = "3")]
    pub timestamp_ms: u64,
}

/// First message of a drone connection
#[derive(Clone, PartialEq, Message)]
pub struct Handshake {
    #[prost(string, tag = "1")]
    pub peer_id: String,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Heartbeat {}

#[derive(Clone, PartialEq, Message)]
pub struct Terminate {
    #[prost(enumeration = "TerminateCode", tag = "1")]
    pub code: i32,

    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Client request opening a new stream on the application protocol
#[derive(Clone, PartialEq, Message)]
pub struct Enqueue {
    #[prost(string, tag = "1")]
    pub event: String,

    /// Empty tag means any drone may serve the request
    #[prost(string, tag = "2")]
    pub tag: String,
}

/// Overseer request opening a new stream on a drone
#[derive(Clone, PartialEq, Message)]
pub struct Invoke {
    #[prost(string, tag = "1")]
    pub event: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Chunk {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamError {
    #[prost(int32, tag = "1")]
    pub code: i32,

    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Choke {}

/// Top-level frame body
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,

    #[prost(oneof = "envelope::Payload", tags = "10, 11, 12, 13, 14, 15, 16, 17")]
    pub payload: Option<envelope::Payload>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Handshake(super::Handshake),
        #[prost(message, tag = "11")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "12")]
        Terminate(super::Terminate),
        #[prost(message, tag = "13")]
        Enqueue(super::Enqueue),
        #[prost(message, tag = "14")]
        Invoke(super::Invoke),
        #[prost(message, tag = "15")]
        Chunk(super::Chunk),
        #[prost(message, tag = "16")]
        Error(super::StreamError),
        #[prost(message, tag = "17")]
        Choke(super::Choke),
    }
}
