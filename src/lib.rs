//! Node-local supervision core.
//!
//! Keeps a tree of supervised units alive through the external process
//! supervisor, applies restart and tombstone policies when units exit,
//! converges requested units into a scan root and escalates node failure
//! through watchdog leases.

pub mod core;
pub mod monitor;
pub mod reconcile;
pub mod supervisor;
pub mod watchdog;
pub mod watcher;

#[cfg(feature = "daemon")]
pub mod daemon;

#[cfg(feature = "cli")]
pub mod cli_app;

pub use crate::core::config::Config;
pub use crate::core::errors::{Result, WardenError};
