//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → FleetConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! Model file (JSON):
//!     watcher.rs detects change
//!     → ModelStore::reload
//!     → atomic swap of Arc<ModelSnapshot>, version bump
//!     → cached artifacts become stale
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{check_config, load_config, read_config, ConfigError};
pub use schema::{
    AdminConfig, CompilersConfig, DispatcherConfig, DnsRouterConfig, FleetConfig, ForwardingProxyConfig,
    HeartbeatConfig, ObservabilityConfig, RetryConfig, RoutingEngineConfig, StoreConfig, SubscriptionConfig,
    PLACEHOLDER_API_KEY,
};
