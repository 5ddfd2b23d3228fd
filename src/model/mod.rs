//! Canonical model subsystem.
//!
//! # Data Flow
//! ```text
//! admin API / subscription resolver / file reload
//!     → store.rs (copy-on-write update, version bump, JSON persist)
//!     → Arc<ModelSnapshot> (immutable)
//!     → rule resolution → compilers → dispatcher
//! ```
//!
//! # Design Decisions
//! - Entities reference each other by id or name, never by pointer
//! - One snapshot per generation run; no torn reads across entity kinds

pub mod store;
pub mod types;

pub use store::{ModelSnapshot, ModelStore, StoreError};
pub use types::{
    Agent, Aggregation, GroupMember, Node, NodeIdentity, NodeSource, Protocol, ProxyGroup, Rule, RuleKind, RuleSet,
    Strategy, Subscription, Target,
};
