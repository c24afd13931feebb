//! Connection management for the drone's link to its overseer
//!
//! This module handles:
//! - The handshake naming the drone on the control channel
//! - Heartbeats at a fixed interval
//! - Invoke streams multiplexed on overseer-opened channels
//! - Reconnection with exponential backoff inside the re-attach window

mod manager;

pub use manager::{ConnectionConfig, ConnectionManager, Termination};
