//! Install parameters for new agents.
//!
//! The install script itself is produced by an external template; the core
//! only assembles the parameters and hands them to an
//! [`InstallScriptRenderer`].

use serde::{Deserialize, Serialize};

use crate::compile::TargetFormat;
use crate::model::Agent;

/// Everything an install script needs to know about its agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallParams {
    /// Base URL of this control plane as reachable from the agent.
    pub server_url: String,
    pub register_url: String,
    /// Bearer token for the registration call, when the server requires one.
    pub register_token: Option<String>,
    pub agent_name: String,
    /// Engine the agent manages (`mihomo`, `surge`, `mosdns`).
    pub service_type: String,
    pub agent_port: u16,
    /// Address the agent should register with; empty lets the server decide.
    pub agent_host: String,
    pub config_path: String,
    pub restart_command: String,
    /// Present for an already registered agent.
    pub agent_id: Option<String>,
    pub token: Option<String>,
}

impl InstallParams {
    /// Parameters for a new agent that will self-register.
    pub fn new(server_url: &str, name: &str, format: TargetFormat, port: u16, host: &str) -> Self {
        let server_url = server_url.trim_end_matches('/').to_string();
        let service = service_type(format);
        Self {
            register_url: format!("{}/api/agents/register", server_url),
            register_token: None,
            server_url,
            agent_name: name.to_string(),
            service_type: service.to_string(),
            agent_port: port,
            agent_host: host.to_string(),
            config_path: default_config_path(format),
            restart_command: format!("systemctl restart {}", service),
            agent_id: None,
            token: None,
        }
    }

    /// Parameters to reinstall an existing agent with its identity.
    pub fn for_agent(agent: &Agent, server_url: &str) -> Self {
        let format = agent.formats.first().copied().unwrap_or(TargetFormat::RoutingEngine);
        let mut params = Self::new(server_url, &agent.name, format, agent.port, &agent.host);
        params.agent_id = Some(agent.id.clone());
        params.token = Some(agent.token.clone());
        params
    }
}

/// Engine name of a format.
pub fn service_type(format: TargetFormat) -> &'static str {
    match format {
        TargetFormat::RoutingEngine => "mihomo",
        TargetFormat::ForwardingProxy => "surge",
        TargetFormat::DnsRouter => "mosdns",
    }
}

fn default_config_path(format: TargetFormat) -> String {
    match format {
        TargetFormat::ForwardingProxy => "/etc/surge/surge.conf".to_string(),
        other => format!("/etc/{}/config.yaml", service_type(other)),
    }
}

/// Turns install parameters into a script or container definition.
pub trait InstallScriptRenderer: Send + Sync {
    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }

    fn render(&self, params: &InstallParams) -> Result<String, String>;
}

/// Renders parameters as a shell-sourceable env file, the input format of
/// the external install templates.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvFileRenderer;

impl InstallScriptRenderer for EnvFileRenderer {
    fn render(&self, params: &InstallParams) -> Result<String, String> {
        let mut vars = vec![
            ("SERVER_URL", params.server_url.clone()),
            ("REGISTER_URL", params.register_url.clone()),
            ("AGENT_NAME", params.agent_name.clone()),
            ("SERVICE_TYPE", params.service_type.clone()),
            ("AGENT_PORT", params.agent_port.to_string()),
            ("AGENT_HOST", params.agent_host.clone()),
            ("CONFIG_PATH", params.config_path.clone()),
            ("RESTART_COMMAND", params.restart_command.clone()),
        ];
        if let Some(token) = &params.register_token {
            vars.push(("REGISTER_TOKEN", token.clone()));
        }
        if let Some(id) = &params.agent_id {
            vars.push(("AGENT_ID", id.clone()));
        }
        if let Some(token) = &params.token {
            vars.push(("AGENT_TOKEN", token.clone()));
        }

        let mut out = String::new();
        for (key, value) in vars {
            if value.contains('\n') {
                return Err(format!("{} contains a newline", key));
            }
            out.push_str(&format!("{}='{}'\n", key, value.replace('\'', r"'\''")));
        }
        Ok(out)
    }
}
