//! Agent fleet subsystem.
//!
//! # Data Flow
//! ```text
//! registry.rs (self-registration) → ModelStore agents
//!
//! dispatcher.rs
//!     → agent.rs (AgentHandle: cached state, per-agent push lock)
//!     → retry.rs (RetryPolicy around every remote call)
//!     → transport.rs (AgentTransport over HTTP)
//!
//! heartbeat.rs (interval) → transport probe → AgentHandle state
//! ```
//!
//! # Design Decisions
//! - The transport is a trait so tests run against an in-memory fleet
//! - Agent state lives in atomics; status reads never wait on I/O

pub mod agent;
pub mod dispatcher;
pub mod heartbeat;
pub mod install;
pub mod registry;
pub mod retry;
pub mod transport;

pub use agent::{AgentHandle, AgentState, AgentStatus};
pub use dispatcher::{
    CommandFailure, CommandReport, Dispatcher, FleetError, FleetResults, FormatPush, PushFailure, PushOutcome,
    PushReport, MAX_LOG_LINES,
};
pub use heartbeat::HeartbeatMonitor;
pub use install::{EnvFileRenderer, InstallParams, InstallScriptRenderer};
pub use registry::{AgentRegistry, Registered, Registration};
pub use retry::{Attempt, RetryPolicy};
pub use transport::{AgentCommand, AgentTransport, HttpAgentTransport, ProbeResult, TransportError, TransportTimeouts};
