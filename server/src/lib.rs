//! Hive overseer
//!
//! Supervises the drones of one application: spawns them through an
//! isolation backend, authenticates their connections with a handshake,
//! tracks liveness through heartbeats and routes client requests to them
//! with per-request ordering.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod isolate;
pub mod listener;
pub mod overseer;
pub mod queue;
pub mod session;

#[cfg(test)]
mod test_support;

pub use config::{OverseerConfig, TagPolicy};
pub use error::OverseerError;
pub use overseer::Overseer;
