//! Session management for drone and client connections
//!
//! This module handles:
//! - Framing envelopes over any byte stream
//! - Multiplexing streams by channel id
//! - Routing each channel to the dispatch currently installed for it
//! - Discarding installed dispatches when the connection goes away

mod connection;

pub use connection::{Session, SessionHandle, Upstream};
