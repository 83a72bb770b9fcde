//! Core plumbing: errors, configuration and filesystem helpers.

pub mod config;
pub mod errors;
pub mod fsops;
