//! Agent fleet dispatcher.
//!
//! # Responsibilities
//! - Push artifacts to agents, skipping formats whose hash is unchanged
//! - Issue lifecycle commands and pass-through log operations
//! - Fan pushes out to the whole fleet under one deadline
//! - Answer `status()` from cached state without touching the network
//!
//! # Data Flow
//! ```text
//! push_fleet(formats, deadline)
//!     → Generator (one snapshot, every needed format, fail before any I/O)
//!     → one task per eligible agent
//!         → AgentHandle::begin_push (per-agent lock, PushInProgress)
//!         → per format, in order: hash check → RetryPolicy::run(transport.push_artifact)
//!         → ModelStore::record_push
//!     → gather with deadline; unfinished tasks aborted → TimedOut
//! ```
//!
//! # Design Decisions
//! - Failures are isolated per agent; the fleet result is a per-agent map
//! - Pushes to one agent never overlap; pushes to different agents run concurrently
//! - Log paths are checked against the agent's allowlist before any remote call

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::compile::{Artifact, GenerationError, Generator, TargetFormat};
use crate::config::DispatcherConfig;
use crate::fleet::agent::{AgentHandle, AgentStatus};
use crate::fleet::retry::{Attempt, RetryPolicy};
use crate::fleet::transport::{AgentCommand, AgentTransport, TransportError};
use crate::model::{Agent, ModelStore};
use crate::observability::metrics;

/// Upper bound on lines returned by a log fetch.
pub const MAX_LOG_LINES: usize = 5000;

/// Per-agent operation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("agent '{0}' is disabled")]
    AgentDisabled(String),

    #[error("agent unreachable after {attempts} attempt(s): {reason}")]
    AgentUnreachable { attempts: u32, reason: String },

    #[error("push of {format} not acknowledged after {attempts} attempt(s)")]
    PushTimeout { format: TargetFormat, attempts: u32 },

    #[error("log path '{0}' is not in the agent's allowlist")]
    InvalidPath(String),

    #[error("agent rejected the token")]
    Unauthorized,

    #[error("agent error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Remote { status: Option<u16>, message: String },

    #[error("fleet deadline passed before the agent finished")]
    TimedOut,

    #[error("agent task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl FleetError {
    /// Whether a later retry could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AgentUnreachable { .. } | Self::PushTimeout { .. } | Self::TimedOut => true,
            Self::Remote { status, .. } => status.is_some_and(|s| s >= 500),
            _ => false,
        }
    }

    fn from_transport(error: TransportError, attempts: u32, format: Option<TargetFormat>) -> Self {
        match error {
            TransportError::Unreachable(reason) => Self::AgentUnreachable { attempts, reason },
            TransportError::Timeout => match format {
                Some(format) => Self::PushTimeout { format, attempts },
                None => Self::AgentUnreachable {
                    attempts,
                    reason: "timed out".to_string(),
                },
            },
            TransportError::Unauthorized => Self::Unauthorized,
            TransportError::Remote { status, message } => Self::Remote {
                status: Some(status),
                message,
            },
            TransportError::Rejected(message) | TransportError::InvalidResponse(message) => {
                Self::Remote { status: None, message }
            }
        }
    }
}

/// What happened to one format of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    /// The agent already runs this exact artifact.
    Skipped,
    Pushed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatPush {
    pub format: TargetFormat,
    pub hash: String,
    pub outcome: PushOutcome,
    pub attempts: Vec<Attempt>,
}

/// Result of a successful push to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub agent_id: String,
    pub formats: Vec<FormatPush>,
}

impl PushReport {
    pub fn transferred(&self) -> usize {
        self.formats.iter().filter(|f| f.outcome == PushOutcome::Pushed).count()
    }
}

/// Result of a successful command or log operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReport {
    pub agent_id: String,
    pub operation: &'static str,
    /// Empty when the operation was a no-op.
    pub attempts: Vec<Attempt>,
}

/// A push that stopped on an error, with the progress made before it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error}")]
pub struct PushFailure {
    pub error: FleetError,
    /// Formats pushed or skipped before the failure; pushed ones are recorded.
    pub formats: Vec<FormatPush>,
    /// Attempts made on the format that failed.
    pub attempts: Vec<Attempt>,
}

impl PushFailure {
    pub fn is_transient(&self) -> bool {
        self.error.is_transient()
    }
}

impl From<FleetError> for PushFailure {
    fn from(error: FleetError) -> Self {
        Self {
            error,
            formats: Vec::new(),
            attempts: Vec::new(),
        }
    }
}

impl From<GenerationError> for PushFailure {
    fn from(error: GenerationError) -> Self {
        FleetError::from(error).into()
    }
}

/// A failed command or log operation with every attempt made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error}")]
pub struct CommandFailure {
    pub error: FleetError,
    /// Empty when the operation was refused before contacting the agent.
    pub attempts: Vec<Attempt>,
}

impl CommandFailure {
    pub fn is_transient(&self) -> bool {
        self.error.is_transient()
    }
}

impl From<FleetError> for CommandFailure {
    fn from(error: FleetError) -> Self {
        Self {
            error,
            attempts: Vec::new(),
        }
    }
}

pub type FleetResults = BTreeMap<String, Result<PushReport, PushFailure>>;

/// Coordinates every remote operation on the fleet.
pub struct Dispatcher {
    store: Arc<ModelStore>,
    generator: Arc<Generator>,
    transport: Arc<dyn AgentTransport>,
    handles: DashMap<String, Arc<AgentHandle>>,
    retry: RetryPolicy,
    settings: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ModelStore>,
        generator: Arc<Generator>,
        transport: Arc<dyn AgentTransport>,
        retry: RetryPolicy,
        settings: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            generator,
            transport,
            handles: DashMap::new(),
            retry,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn AgentTransport> {
        &self.transport
    }

    /// Runtime handle for `agent`, kept in step with its stored `disabled` flag.
    pub fn handle_for(&self, agent: &Agent) -> Arc<AgentHandle> {
        let handle = self
            .handles
            .entry(agent.id.clone())
            .or_insert_with(|| Arc::new(AgentHandle::new(agent.id.clone(), agent.disabled)))
            .value()
            .clone();
        match (agent.disabled, handle.is_disabled()) {
            (true, false) => handle.disable(),
            (false, true) => handle.enable(),
            _ => {}
        }
        handle
    }

    /// Forget runtime state of agents no longer in the store.
    pub fn prune_handles(&self) {
        let snapshot = self.store.snapshot();
        self.handles.retain(|id, _| snapshot.agent(id).is_some());
    }

    fn agent(&self, agent_id: &str) -> Result<Agent, FleetError> {
        self.store
            .snapshot()
            .agent(agent_id)
            .cloned()
            .ok_or_else(|| FleetError::AgentNotFound(agent_id.to_string()))
    }

    fn active_agent(&self, agent_id: &str) -> Result<Agent, FleetError> {
        let agent = self.agent(agent_id)?;
        if agent.disabled || !agent.enabled {
            return Err(FleetError::AgentDisabled(agent.id));
        }
        Ok(agent)
    }

    // --- Status ---

    /// Last known state; never blocks on the network.
    pub fn status(&self, agent_id: &str) -> Result<AgentStatus, FleetError> {
        let agent = self.agent(agent_id)?;
        Ok(self.handle_for(&agent).status())
    }

    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.store
            .snapshot()
            .agents
            .iter()
            .map(|agent| self.handle_for(agent).status())
            .collect()
    }

    // --- Push ---

    /// Push `formats` to one agent; an empty list means every format it serves.
    pub async fn push_config(&self, agent_id: &str, formats: &[TargetFormat]) -> Result<PushReport, PushFailure> {
        let agent = self.active_agent(agent_id)?;
        let formats = if formats.is_empty() {
            agent.formats.clone()
        } else {
            formats.to_vec()
        };
        let artifacts = self.generator.generate_all(&formats)?;
        self.push_artifacts(&agent, &artifacts).await
    }

    /// Push to every eligible agent concurrently.
    ///
    /// Each agent receives the requested formats it serves (all formats when
    /// `formats` is empty). Generation failures abort before any agent is
    /// contacted.
    pub async fn push_fleet(
        self: &Arc<Self>,
        formats: &[TargetFormat],
        deadline: Option<Duration>,
    ) -> Result<FleetResults, FleetError> {
        let snapshot = self.store.snapshot();
        let requested: BTreeSet<TargetFormat> = if formats.is_empty() {
            TargetFormat::ALL.into_iter().collect()
        } else {
            formats.iter().copied().collect()
        };

        let targets: Vec<(Agent, Vec<TargetFormat>)> = snapshot
            .agents
            .iter()
            .filter(|a| a.enabled && !a.disabled)
            .map(|a| {
                let wanted: Vec<TargetFormat> =
                    a.formats.iter().copied().filter(|f| requested.contains(f)).collect();
                (a.clone(), wanted)
            })
            .filter(|(_, wanted)| !wanted.is_empty())
            .collect();

        let needed: BTreeSet<TargetFormat> = targets.iter().flat_map(|(_, f)| f.iter().copied()).collect();
        let mut artifacts = BTreeMap::new();
        for format in needed {
            artifacts.insert(format, self.generator.generate_from(&snapshot, format)?);
        }

        let deadline = deadline.unwrap_or(Duration::from_secs(self.settings.fleet_deadline_secs));
        tracing::info!(
            agents = targets.len(),
            formats = artifacts.len(),
            version = snapshot.version,
            deadline_secs = deadline.as_secs_f64(),
            "Starting fleet push"
        );

        let tasks: Vec<(String, JoinHandle<Result<PushReport, PushFailure>>)> = targets
            .into_iter()
            .map(|(agent, wanted)| {
                let subset: BTreeMap<TargetFormat, Arc<Artifact>> = wanted
                    .iter()
                    .filter_map(|f| artifacts.get(f).map(|a| (*f, Arc::clone(a))))
                    .collect();
                let this = Arc::clone(self);
                let id = agent.id.clone();
                let task = tokio::spawn(async move { this.push_artifacts(&agent, &subset).await });
                (id, task)
            })
            .collect();

        let expires = Instant::now() + deadline;
        let mut results = BTreeMap::new();
        for (agent_id, mut task) in tasks {
            let result = match tokio::time::timeout_at(expires, &mut task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(FleetError::TaskFailed(join_error.to_string()).into()),
                Err(_) => cancel_late(&agent_id, task).await,
            };
            results.insert(agent_id, result);
        }

        let failed = results.values().filter(|r| r.is_err()).count();
        tracing::info!(agents = results.len(), failed, "Fleet push finished");
        Ok(results)
    }

    /// Sequential per-format push under the agent's push lock.
    async fn push_artifacts(
        &self,
        agent: &Agent,
        artifacts: &BTreeMap<TargetFormat, Arc<Artifact>>,
    ) -> Result<PushReport, PushFailure> {
        let handle = self.handle_for(agent);
        let guard = handle
            .begin_push()
            .await
            .ok_or_else(|| FleetError::AgentDisabled(agent.id.clone()))?;

        // Re-read after taking the lock so a push that just finished is seen.
        let last_pushed = self
            .store
            .snapshot()
            .agent(&agent.id)
            .map(|a| a.last_pushed.clone())
            .unwrap_or_default();

        let mut report = PushReport {
            agent_id: agent.id.clone(),
            formats: Vec::new(),
        };

        for (&format, artifact) in artifacts {
            if last_pushed.get(&format) == Some(&artifact.hash) {
                tracing::debug!(agent_id = %agent.id, format = %format, "Artifact unchanged, skipping push");
                metrics::record_push(format.as_str(), "skipped");
                report.formats.push(FormatPush {
                    format,
                    hash: artifact.hash.clone(),
                    outcome: PushOutcome::Skipped,
                    attempts: Vec::new(),
                });
                continue;
            }

            let transport = &self.transport;
            let limit = Duration::from_secs(self.settings.push_timeout_secs);
            let retried = self
                .retry
                .run("push", &agent.id, move || bounded(limit, transport.push_artifact(agent, artifact)))
                .await;
            let attempts = retried.attempt_count();

            match retried.result {
                Ok(()) => {
                    metrics::record_push(format.as_str(), "pushed");
                    tracing::info!(
                        agent_id = %agent.id,
                        format = %format,
                        hash = %artifact.hash,
                        attempts,
                        "Pushed artifact"
                    );
                    if let Err(e) = self.store.record_push(&agent.id, format, &artifact.hash) {
                        tracing::error!(agent_id = %agent.id, format = %format, error = %e, "Failed to record push");
                    }
                    report.formats.push(FormatPush {
                        format,
                        hash: artifact.hash.clone(),
                        outcome: PushOutcome::Pushed,
                        attempts: retried.attempts,
                    });
                }
                Err(e) => {
                    metrics::record_push(format.as_str(), "failed");
                    let error = FleetError::from_transport(e, attempts, Some(format));
                    guard.fail(&error.to_string());
                    tracing::warn!(agent_id = %agent.id, format = %format, error = %error, "Push failed");
                    return Err(PushFailure {
                        error,
                        formats: report.formats,
                        attempts: retried.attempts,
                    });
                }
            }
        }

        guard.succeed(report.transferred() > 0);
        Ok(report)
    }

    // --- Commands ---

    pub async fn restart(&self, agent_id: &str) -> Result<CommandReport, CommandFailure> {
        let agent = self.active_agent(agent_id)?;
        self.command(&agent, AgentCommand::Restart).await
    }

    /// Uninstall the agent and mark it disabled. Repeating it is a no-op.
    pub async fn uninstall(&self, agent_id: &str) -> Result<CommandReport, CommandFailure> {
        let agent = self.agent(agent_id)?;
        if agent.disabled {
            tracing::debug!(agent_id = %agent.id, "Agent already disabled, uninstall is a no-op");
            return Ok(CommandReport {
                agent_id: agent.id,
                operation: AgentCommand::Uninstall.as_str(),
                attempts: Vec::new(),
            });
        }

        let report = self.command(&agent, AgentCommand::Uninstall).await?;
        if let Err(e) = self.store.set_agent_disabled(&agent.id, true) {
            tracing::error!(agent_id = %agent.id, error = %e, "Failed to persist disabled agent");
        }
        self.handle_for(&agent).disable();
        tracing::info!(agent_id = %agent.id, "Agent uninstalled and disabled");
        Ok(report)
    }

    pub async fn set_logging(&self, agent_id: &str, enabled: bool) -> Result<CommandReport, CommandFailure> {
        let agent = self.active_agent(agent_id)?;
        self.command(&agent, AgentCommand::SetLogging(enabled)).await
    }

    async fn command(&self, agent: &Agent, command: AgentCommand) -> Result<CommandReport, CommandFailure> {
        let transport = &self.transport;
        let limit = Duration::from_secs(self.settings.command_timeout_secs);
        let retried = self
            .retry
            .run(command.as_str(), &agent.id, move || bounded(limit, transport.command(agent, command)))
            .await;
        let attempts = retried.attempt_count();

        metrics::record_command(command.as_str(), retried.result.is_ok());
        match retried.result {
            Ok(()) => {
                self.handle_for(agent).mark_contact();
                tracing::info!(agent_id = %agent.id, command = command.as_str(), attempts, "Agent command succeeded");
                Ok(CommandReport {
                    agent_id: agent.id.clone(),
                    operation: command.as_str(),
                    attempts: retried.attempts,
                })
            }
            Err(e) => {
                let error = FleetError::from_transport(e, attempts, None);
                self.handle_for(agent).set_error(&error.to_string());
                Err(CommandFailure {
                    error,
                    attempts: retried.attempts,
                })
            }
        }
    }

    // --- Logs ---

    /// Last `max_lines` lines (clamped to `1..=max_log_lines`) of an allowlisted log.
    pub async fn fetch_logs(
        &self,
        agent_id: &str,
        path: &str,
        max_lines: usize,
    ) -> Result<Vec<String>, CommandFailure> {
        let agent = self.active_agent(agent_id)?;
        check_log_path(&agent, path)?;
        let max_lines = max_lines.clamp(1, self.settings.max_log_lines.clamp(1, MAX_LOG_LINES));

        let transport = &self.transport;
        let agent_ref = &agent;
        let limit = Duration::from_secs(self.settings.command_timeout_secs);
        let retried = self
            .retry
            .run("fetch-logs", &agent.id, move || {
                bounded(limit, transport.fetch_logs(agent_ref, path, max_lines))
            })
            .await;
        let attempts = retried.attempt_count();
        metrics::record_command("fetch-logs", retried.result.is_ok());
        match retried.result {
            Ok(lines) => Ok(lines),
            Err(e) => Err(CommandFailure {
                error: FleetError::from_transport(e, attempts, None),
                attempts: retried.attempts,
            }),
        }
    }

    pub async fn clear_log(&self, agent_id: &str, path: &str) -> Result<CommandReport, CommandFailure> {
        let agent = self.active_agent(agent_id)?;
        check_log_path(&agent, path)?;

        let transport = &self.transport;
        let agent_ref = &agent;
        let limit = Duration::from_secs(self.settings.command_timeout_secs);
        let retried = self
            .retry
            .run("clear-log", &agent.id, move || bounded(limit, transport.clear_log(agent_ref, path)))
            .await;
        let attempts = retried.attempt_count();
        metrics::record_command("clear-log", retried.result.is_ok());
        match retried.result {
            Ok(()) => {
                tracing::info!(agent_id = %agent.id, path, "Cleared agent log");
                Ok(CommandReport {
                    agent_id: agent.id.clone(),
                    operation: "clear-log",
                    attempts: retried.attempts,
                })
            }
            Err(e) => Err(CommandFailure {
                error: FleetError::from_transport(e, attempts, None),
                attempts: retried.attempts,
            }),
        }
    }
}

/// Cancel a task that missed the fleet deadline. A task that completed
/// between the deadline and the abort keeps its result.
async fn cancel_late(
    agent_id: &str,
    task: JoinHandle<Result<PushReport, PushFailure>>,
) -> Result<PushReport, PushFailure> {
    task.abort();
    // Wait for the cancellation so the push guard has run.
    match task.await {
        Ok(result) => {
            tracing::debug!(agent_id, "Agent push completed at the fleet deadline");
            result
        }
        Err(e) if e.is_cancelled() => {
            tracing::warn!(agent_id, "Agent push still pending at fleet deadline");
            Err(FleetError::TimedOut.into())
        }
        Err(e) => Err(FleetError::TaskFailed(e.to_string()).into()),
    }
}

/// Absolute, free of `..`, and listed verbatim in the agent's allowlist.
fn check_log_path(agent: &Agent, path: &str) -> Result<(), FleetError> {
    let candidate = Path::new(path);
    let traverses = candidate.components().any(|c| matches!(c, Component::ParentDir));
    if !candidate.is_absolute() || traverses || !agent.log_paths.iter().any(|p| p == path) {
        tracing::warn!(agent_id = %agent.id, path, "Rejected log path outside allowlist");
        return Err(FleetError::InvalidPath(path.to_string()));
    }
    Ok(())
}

async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T, TransportError>>) -> Result<T, TransportError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(TransportError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(log_paths: &[&str]) -> Agent {
        Agent {
            id: "a1".into(),
            name: "edge".into(),
            host: "10.0.0.2".into(),
            port: 8080,
            token: "t".into(),
            formats: vec![TargetFormat::RoutingEngine],
            log_paths: log_paths.iter().map(|p| p.to_string()).collect(),
            enabled: true,
            disabled: false,
            version: None,
            last_pushed: BTreeMap::new(),
        }
    }

    #[test]
    fn test_log_path_allowlist() {
        let a = agent(&["/var/log/mihomo.log", "/var/log/../etc/shadow"]);
        assert!(check_log_path(&a, "/var/log/mihomo.log").is_ok());
        assert_eq!(
            check_log_path(&a, "/etc/shadow"),
            Err(FleetError::InvalidPath("/etc/shadow".into()))
        );
        assert!(check_log_path(&a, "/var/log/../etc/shadow").is_err());
        assert!(check_log_path(&a, "var/log/mihomo.log").is_err());
    }

    fn report() -> PushReport {
        PushReport {
            agent_id: "a1".into(),
            formats: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_late_cancel_keeps_finished_result() {
        let task = tokio::spawn(async { Ok(report()) });
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(cancel_late("a1", task).await, Ok(report()));
    }

    #[tokio::test]
    async fn test_late_cancel_of_pending_task_times_out() {
        let task = tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok(report())
        });
        let err = cancel_late("a1", task).await.unwrap_err();
        assert_eq!(err.error, FleetError::TimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_mapping_and_transience() {
        let e = FleetError::from_transport(TransportError::Timeout, 3, Some(TargetFormat::DnsRouter));
        assert_eq!(
            e,
            FleetError::PushTimeout {
                format: TargetFormat::DnsRouter,
                attempts: 3
            }
        );
        assert!(e.is_transient());

        let e = FleetError::from_transport(TransportError::Unauthorized, 1, None);
        assert!(!e.is_transient());

        let e = FleetError::from_transport(TransportError::Rejected("bad".into()), 1, None);
        assert_eq!(e.to_string(), "agent error: bad");
        assert!(!FleetError::InvalidPath("/x".into()).is_transient());
    }
}
