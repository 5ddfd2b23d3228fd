//! Subscription resolution subsystem.
//!
//! # Data Flow
//! ```text
//! resolve(subscription id, preview)
//!     → resolver.rs (join or start the single in-flight fetch for that id)
//!     → source.rs (GET url → raw bytes)
//!     → parser.rs (format detection → parsed entries)
//!     → resolver.rs (dedupe, stable ids, unique names)
//!     → ModelStore::replace_subscription_nodes (unless preview)
//! ```
//!
//! # Design Decisions
//! - At most one fetch per subscription id is ever in flight; late callers
//!   await the same shared future
//! - An empty result is a failure and never wipes the previously stored nodes
//! - Errors are `Clone` so every joined caller receives the same outcome

pub mod parser;
pub mod resolver;
pub mod source;

use thiserror::Error;

pub use parser::{parse_subscription, ParsedNode};
pub use resolver::SubscriptionResolver;
pub use source::{HttpSubscriptionSource, SubscriptionSource};

/// Subscription layer failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Network failure, timeout or non-success status.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Body has no recognizable structure.
    #[error("unrecognized subscription content: {0}")]
    Parse(String),

    /// Content parsed but yielded zero nodes.
    #[error("subscription '{0}' yielded no nodes")]
    EmptyResult(String),

    #[error("subscription '{0}' not found")]
    NotFound(String),

    #[error("subscription '{0}' is disabled")]
    Disabled(String),

    /// Persisting the node set failed.
    #[error("failed to store nodes: {0}")]
    Store(String),
}

impl SubscriptionError {
    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch_error",
            Self::Parse(_) => "parse_error",
            Self::EmptyResult(_) => "empty_result",
            Self::NotFound(_) => "not_found",
            Self::Disabled(_) => "disabled",
            Self::Store(_) => "store_error",
        }
    }
}
