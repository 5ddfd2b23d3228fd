//! Crate-level error.

use thiserror::Error;

use crate::compile::GenerationError;
use crate::config::ConfigError;
use crate::fleet::FleetError;
use crate::model::StoreError;
use crate::subscription::SubscriptionError;

/// Any failure surfaced to the daemon entry point.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("model store: {0}")]
    Store(#[from] StoreError),

    #[error("subscription: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("generation: {0}")]
    Generation(#[from] GenerationError),

    #[error("fleet: {0}")]
    Fleet(#[from] FleetError),

    #[error("HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("model watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
