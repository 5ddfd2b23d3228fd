//! Proxy fleet control plane.
//!
//! Turns a canonical model of proxy nodes, subscriptions, rules and groups
//! into configuration artifacts for three engine families, and keeps a fleet
//! of remote agents running the current artifacts.

pub mod admin;
pub mod compile;
pub mod config;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod model;
pub mod observability;
pub mod rules;
pub mod subscription;

pub use config::schema::FleetConfig;
pub use error::{Error, Result};
pub use lifecycle::{Services, Shutdown};
