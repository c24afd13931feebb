//! Request execution for the drone
//!
//! This module handles:
//! - Looking up the handler registered for an invoked event
//! - Running it over the collected request body
//! - Turning its result into the response stream (`chunk*` + `choke`, or `error`)

mod executor;
pub mod handlers;

pub use executor::{CommandExecutor, CommandResult, HANDLER_FAILED};
