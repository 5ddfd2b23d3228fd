//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Open model → Build subsystems
//!     → Start watcher and heartbeat → Bind admin listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → heartbeat exits, admin server drains
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then store, then background tasks, listener last
//! - One broadcast channel reaches every long-running task

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::Services;
