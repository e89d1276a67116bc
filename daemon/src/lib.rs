//! Formic daemon: long-running host process for the workflow engine.
//!
//! Owns the task store, runs crash recovery at startup, and keeps the queue
//! scheduler polling until shutdown.

pub mod config;

pub use config::DaemonConfig;

/// Daemon version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
