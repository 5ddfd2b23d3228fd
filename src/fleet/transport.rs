//! Agent transport.
//!
//! # Responsibilities
//! - Abstract every remote call the dispatcher makes to one agent
//! - Speak the agent HTTP API with bearer-token auth
//! - Classify failures as transient (retryable) or not
//!
//! # Agent API
//! ```text
//! POST /api/config/update   {format, config, hash}  → {success, message}
//! POST /api/restart                                 → {success, message}
//! POST /api/uninstall                               → {success, message}
//! POST /api/config/logging  {enabled}               → {success, message}
//! GET  /api/logs?lines=&log_path=                   → {success, logs}
//! POST /api/logs/clear      {log_path}              → {success, message}
//! GET  /health                                      → {status, version}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::compile::Artifact;
use crate::model::Agent;

/// Lifecycle command sent to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "enabled", rename_all = "kebab-case")]
pub enum AgentCommand {
    Restart,
    Uninstall,
    SetLogging(bool),
}

impl AgentCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Uninstall => "uninstall",
            Self::SetLogging(_) => "set-logging",
        }
    }
}

/// Liveness answer of an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub version: Option<String>,
}

/// Failure of a single remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("agent did not answer in time")]
    Timeout,

    #[error("agent rejected the token")]
    Unauthorized,

    #[error("agent returned HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    /// HTTP success but `success: false` in the body.
    #[error("agent refused: {0}")]
    Rejected(String),

    #[error("malformed agent response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout => true,
            Self::Remote { status, .. } => *status >= 500,
            Self::Unauthorized | Self::Rejected(_) | Self::InvalidResponse(_) => false,
        }
    }
}

/// Remote operations on one agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Transfer an artifact and wait for the acknowledgment.
    async fn push_artifact(&self, agent: &Agent, artifact: &Artifact) -> Result<(), TransportError>;

    async fn command(&self, agent: &Agent, command: AgentCommand) -> Result<(), TransportError>;

    /// Last `max_lines` lines of a remote log file.
    async fn fetch_logs(&self, agent: &Agent, path: &str, max_lines: usize) -> Result<Vec<String>, TransportError>;

    async fn clear_log(&self, agent: &Agent, path: &str) -> Result<(), TransportError>;

    async fn probe(&self, agent: &Agent) -> Result<ProbeResult, TransportError>;
}

/// Timeouts of the HTTP transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportTimeouts {
    pub push: Duration,
    pub command: Duration,
    pub probe: Duration,
}

/// Agent transport over the agent HTTP API.
pub struct HttpAgentTransport {
    client: reqwest::Client,
    timeouts: TransportTimeouts,
}

#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    logs: Option<Value>,
}

fn default_success() -> bool {
    true
}

impl HttpAgentTransport {
    pub fn new(timeouts: TransportTimeouts) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fleet-forge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeouts })
    }

    async fn send(&self, request: reqwest::RequestBuilder, agent: &Agent, timeout: Duration) -> Result<AgentReply, TransportError> {
        let response = request
            .bearer_auth(&agent.token)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(256);
            return Err(TransportError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        let reply: AgentReply = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        if !reply.success {
            return Err(TransportError::Rejected(
                reply.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(reply)
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn push_artifact(&self, agent: &Agent, artifact: &Artifact) -> Result<(), TransportError> {
        let url = format!("{}/api/config/update", agent.endpoint());
        let body = json!({
            "format": artifact.format,
            "config": artifact.content,
            "hash": artifact.hash,
        });
        self.send(self.client.post(url).json(&body), agent, self.timeouts.push)
            .await
            .map(|_| ())
    }

    async fn command(&self, agent: &Agent, command: AgentCommand) -> Result<(), TransportError> {
        let endpoint = agent.endpoint();
        let request = match command {
            AgentCommand::Restart => self.client.post(format!("{}/api/restart", endpoint)),
            AgentCommand::Uninstall => self.client.post(format!("{}/api/uninstall", endpoint)),
            AgentCommand::SetLogging(enabled) => self
                .client
                .post(format!("{}/api/config/logging", endpoint))
                .json(&json!({ "enabled": enabled })),
        };
        self.send(request, agent, self.timeouts.command).await.map(|_| ())
    }

    async fn fetch_logs(&self, agent: &Agent, path: &str, max_lines: usize) -> Result<Vec<String>, TransportError> {
        let request = self
            .client
            .get(format!("{}/api/logs", agent.endpoint()))
            .query(&[("lines", max_lines.to_string()), ("log_path", path.to_string())]);
        let reply = self.send(request, agent, self.timeouts.command).await?;
        let lines = match reply.logs {
            Some(Value::String(text)) => text.lines().map(str::to_string).collect(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(TransportError::InvalidResponse(format!("unexpected logs value: {}", other)));
            }
        };
        Ok(lines)
    }

    async fn clear_log(&self, agent: &Agent, path: &str) -> Result<(), TransportError> {
        let request = self
            .client
            .post(format!("{}/api/logs/clear", agent.endpoint()))
            .json(&json!({ "log_path": path }));
        self.send(request, agent, self.timeouts.command).await.map(|_| ())
    }

    async fn probe(&self, agent: &Agent) -> Result<ProbeResult, TransportError> {
        let response = self
            .client
            .get(format!("{}/health", agent.endpoint()))
            .timeout(self.timeouts.probe)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Remote {
                status: status.as_u16(),
                message: "health check failed".to_string(),
            });
        }
        // Older agents answer with plain text.
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(ProbeResult {
            version: body.get("version").and_then(Value::as_str).map(str::to_string),
        })
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Unreachable(e.to_string())
    }
}
