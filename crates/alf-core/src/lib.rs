//! Core routing logic for the alf chat bot.
//!
//! This crate is intentionally framework-agnostic. The chat platform, the
//! relational repository and the work queue live behind ports (traits)
//! implemented in adapter crates.

pub mod bot;
pub mod classify;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod memory;
pub mod ports;
pub mod stats;
pub mod subscriptions;
pub mod triggers;

pub use errors::{Error, Result};
