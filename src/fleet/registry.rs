//! Agent self-registration.

use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::compile::TargetFormat;
use crate::model::{Agent, ModelStore, StoreError};

/// What an agent reports when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub formats: Vec<TargetFormat>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub log_paths: Vec<String>,
}

fn default_port() -> u16 {
    8080
}

/// Identity handed back to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registered {
    pub id: String,
    pub token: String,
    /// False when an existing record was refreshed.
    pub created: bool,
}

pub struct AgentRegistry {
    store: Arc<ModelStore>,
}

impl AgentRegistry {
    pub fn new(store: Arc<ModelStore>) -> Self {
        Self { store }
    }

    /// Register or refresh an agent.
    ///
    /// An agent with the same name and host keeps its id and token; anything
    /// else gets a fresh identity. Registering re-enables a disabled agent.
    pub fn register(&self, registration: Registration) -> Result<Registered, StoreError> {
        if registration.name.trim().is_empty() || registration.host.trim().is_empty() {
            return Err(StoreError::Invalid {
                kind: "agent",
                reason: "name and host are required".into(),
            });
        }

        let mut outcome = None;
        self.store.update(|model| {
            let existing = model
                .agents
                .iter_mut()
                .find(|a| a.name == registration.name && a.host == registration.host);

            let registered = match existing {
                Some(agent) => {
                    agent.port = registration.port;
                    agent.formats = registration.formats.clone();
                    agent.enabled = true;
                    agent.disabled = false;
                    if registration.version.is_some() {
                        agent.version = registration.version.clone();
                    }
                    if !registration.log_paths.is_empty() {
                        agent.log_paths = registration.log_paths.clone();
                    }
                    Registered {
                        id: agent.id.clone(),
                        token: agent.token.clone(),
                        created: false,
                    }
                }
                None => {
                    let agent = Agent {
                        id: uuid::Uuid::new_v4().to_string(),
                        name: registration.name.clone(),
                        host: registration.host.clone(),
                        port: registration.port,
                        token: generate_token(),
                        formats: registration.formats.clone(),
                        log_paths: registration.log_paths.clone(),
                        enabled: true,
                        disabled: false,
                        version: registration.version.clone(),
                        last_pushed: Default::default(),
                    };
                    let registered = Registered {
                        id: agent.id.clone(),
                        token: agent.token.clone(),
                        created: true,
                    };
                    model.agents.push(agent);
                    registered
                }
            };
            outcome = Some(registered);
            Ok(())
        })?;

        let registered = outcome.ok_or(StoreError::Invalid {
            kind: "agent",
            reason: "registration produced no record".into(),
        })?;
        tracing::info!(
            agent_id = %registered.id,
            name = %registration.name,
            host = %registration.host,
            created = registered.created,
            "Agent registered"
        );
        Ok(registered)
    }
}

/// 32 URL-safe characters from 24 random bytes.
pub fn generate_token() -> String {
    let bytes: [u8; 24] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Address to record for a registering agent.
///
/// Agents inside containers report a bridge or loopback address; the peer
/// address of the registration request is used instead.
pub fn effective_host(reported: &str, peer: Option<IpAddr>) -> String {
    let reported = reported.trim();
    let unusable = match reported.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_unspecified() || (ip.octets()[0] == 172 && (17..=31).contains(&ip.octets()[1]))
        }
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => reported.is_empty() || reported.eq_ignore_ascii_case("localhost"),
    };
    match (unusable, peer) {
        (true, Some(peer)) => peer.to_string(),
        _ => reported.to_string(),
    }
}
