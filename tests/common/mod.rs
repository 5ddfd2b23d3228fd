//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use fleet_forge::compile::{Artifact, TargetFormat};
use fleet_forge::config::FleetConfig;
use fleet_forge::fleet::{AgentCommand, AgentTransport, ProbeResult, TransportError};
use fleet_forge::model::{
    Agent, GroupMember, ModelSnapshot, ModelStore, Node, NodeSource, Protocol, ProxyGroup, Rule, RuleKind,
    Strategy, Subscription, Target,
};
use fleet_forge::rules::Matcher;
use fleet_forge::subscription::{SubscriptionError, SubscriptionSource};
use fleet_forge::Services;

// --- Fake agent transport ---

#[derive(Default)]
struct AgentBehavior {
    delay: Option<Duration>,
    /// Transient failures still to inject before succeeding.
    transient_failures: u32,
    /// Failure returned on every call.
    permanent: Option<TransportError>,
    /// Failures returned only for pushes of one format.
    format_failures: HashMap<TargetFormat, TransportError>,
    logs: Vec<String>,
    version: Option<String>,
}

/// In-memory fleet recording every call.
#[derive(Default)]
pub struct FakeTransport {
    behaviors: Mutex<HashMap<String, AgentBehavior>>,
    pub pushes: Mutex<Vec<(String, TargetFormat, String)>>,
    pub commands: Mutex<Vec<(String, AgentCommand)>>,
    pub push_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub log_calls: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_behavior<R>(&self, agent_id: &str, f: impl FnOnce(&mut AgentBehavior) -> R) -> R {
        let mut behaviors = self.behaviors.lock().unwrap();
        f(behaviors.entry(agent_id.to_string()).or_default())
    }

    pub fn set_delay(&self, agent_id: &str, delay: Duration) {
        self.with_behavior(agent_id, |b| b.delay = Some(delay));
    }

    pub fn fail_transiently(&self, agent_id: &str, times: u32) {
        self.with_behavior(agent_id, |b| b.transient_failures = times);
    }

    pub fn fail_always(&self, agent_id: &str, error: TransportError) {
        self.with_behavior(agent_id, |b| b.permanent = Some(error));
    }

    pub fn fail_format(&self, agent_id: &str, format: TargetFormat, error: TransportError) {
        self.with_behavior(agent_id, |b| {
            b.format_failures.insert(format, error);
        });
    }

    pub fn heal(&self, agent_id: &str) {
        self.with_behavior(agent_id, |b| {
            b.permanent = None;
            b.transient_failures = 0;
        });
    }

    pub fn set_logs(&self, agent_id: &str, lines: &[&str]) {
        self.with_behavior(agent_id, |b| b.logs = lines.iter().map(|l| l.to_string()).collect());
    }

    pub fn set_version(&self, agent_id: &str, version: &str) {
        self.with_behavior(agent_id, |b| b.version = Some(version.to_string()));
    }

    pub fn push_count(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn pushes_to(&self, agent_id: &str) -> Vec<TargetFormat> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == agent_id)
            .map(|(_, format, _)| *format)
            .collect()
    }

    /// Sleep, then decide whether this call fails.
    async fn gate(&self, agent_id: &str) -> Result<(), TransportError> {
        let delay = self.with_behavior(agent_id, |b| b.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_behavior(agent_id, |b| {
            if let Some(error) = &b.permanent {
                return Err(error.clone());
            }
            if b.transient_failures > 0 {
                b.transient_failures -= 1;
                return Err(TransportError::Unreachable("connection refused".into()));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn push_artifact(&self, agent: &Agent, artifact: &Artifact) -> Result<(), TransportError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(&agent.id).await?;
        if let Some(error) = self.with_behavior(&agent.id, |b| b.format_failures.get(&artifact.format).cloned()) {
            return Err(error);
        }
        self.pushes
            .lock()
            .unwrap()
            .push((agent.id.clone(), artifact.format, artifact.hash.clone()));
        Ok(())
    }

    async fn command(&self, agent: &Agent, command: AgentCommand) -> Result<(), TransportError> {
        self.gate(&agent.id).await?;
        self.commands.lock().unwrap().push((agent.id.clone(), command));
        Ok(())
    }

    async fn fetch_logs(&self, agent: &Agent, _path: &str, max_lines: usize) -> Result<Vec<String>, TransportError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(&agent.id).await?;
        let logs = self.with_behavior(&agent.id, |b| b.logs.clone());
        let skip = logs.len().saturating_sub(max_lines);
        Ok(logs.into_iter().skip(skip).collect())
    }

    async fn clear_log(&self, agent: &Agent, _path: &str) -> Result<(), TransportError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(&agent.id).await
    }

    async fn probe(&self, agent: &Agent) -> Result<ProbeResult, TransportError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(&agent.id).await?;
        Ok(ProbeResult {
            version: self.with_behavior(&agent.id, |b| b.version.clone()),
        })
    }
}

// --- Fake subscription source ---

/// Serves fixed bodies per URL and counts fetches.
#[derive(Default)]
pub struct FakeSource {
    bodies: Mutex<HashMap<String, Result<Vec<u8>, SubscriptionError>>>,
    delay: Mutex<Option<Duration>>,
    pub fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.as_bytes().to_vec()));
    }

    pub fn fail(&self, url: &str, error: SubscriptionError) {
        self.bodies.lock().unwrap().insert(url.to_string(), Err(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionSource for FakeSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SubscriptionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(SubscriptionError::Fetch(format!("no body for {}", url))))
    }
}

// --- Model fixtures ---

pub fn ss_node(id: &str, name: &str, server: &str) -> Node {
    Node {
        id: id.into(),
        name: name.into(),
        protocol: Protocol::Shadowsocks,
        server: server.into(),
        port: 8388,
        params: BTreeMap::from([
            ("cipher".to_string(), json!("aes-256-gcm")),
            ("password".to_string(), json!("secret")),
        ]),
        source: NodeSource::Manual,
        pinned: false,
        enabled: true,
        tags: vec![],
    }
}

pub fn vless_node(id: &str, name: &str, server: &str) -> Node {
    Node {
        id: id.into(),
        name: name.into(),
        protocol: Protocol::Vless,
        server: server.into(),
        port: 443,
        params: BTreeMap::from([("uuid".to_string(), json!("b831381d-6324-4d53-ad4f-8cda48b30811"))]),
        source: NodeSource::Manual,
        pinned: false,
        enabled: true,
        tags: vec![],
    }
}

pub fn group(name: &str, members: Vec<GroupMember>) -> ProxyGroup {
    ProxyGroup {
        name: name.into(),
        strategy: Strategy::Select,
        members,
        test_url: None,
        interval_secs: None,
        enabled: true,
    }
}

pub fn rule(id: &str, position: u32, matcher: Matcher, target: Target) -> Rule {
    Rule {
        id: id.into(),
        position,
        kind: RuleKind::Matcher { matcher },
        target,
        enabled: true,
    }
}

pub fn rule_set_rule(id: &str, position: u32, set: &str, target: Target) -> Rule {
    Rule {
        id: id.into(),
        position,
        kind: RuleKind::RuleSet { name: set.into() },
        target,
        enabled: true,
    }
}

pub fn agent(id: &str, formats: &[TargetFormat]) -> Agent {
    Agent {
        id: id.into(),
        name: format!("agent-{}", id),
        host: "192.0.2.10".into(),
        port: 8080,
        token: format!("token-{}", id),
        formats: formats.to_vec(),
        log_paths: vec!["/var/log/mihomo/mihomo.log".into()],
        enabled: true,
        disabled: false,
        version: None,
        last_pushed: BTreeMap::new(),
    }
}

pub fn subscription(id: &str, url: &str) -> Subscription {
    Subscription {
        id: id.into(),
        name: format!("sub {}", id),
        url: url.into(),
        enabled: true,
        last_fetched_at: None,
        last_hash: None,
        node_count: 0,
    }
}

/// Two nodes, one group and a small ordered rule list.
pub fn basic_model() -> ModelSnapshot {
    ModelSnapshot {
        nodes: vec![ss_node("n1", "Tokyo", "jp.example.net"), ss_node("n2", "Osaka", "os.example.net")],
        groups: vec![group(
            "Proxy",
            vec![GroupMember::Node("n1".into()), GroupMember::Node("n2".into())],
        )],
        rules: vec![
            rule("r1", 10, Matcher::DomainSuffix("google.com".into()), Target::Group("Proxy".into())),
            rule("r2", 20, Matcher::Domain("ads.example.com".into()), Target::Reject),
            rule("r3", 30, Matcher::GeoIp("CN".into()), Target::Direct),
            rule("r4", 40, Matcher::Final, Target::Group("Proxy".into())),
        ],
        ..Default::default()
    }
}

/// Test config: fast retries, short timeouts.
pub fn test_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.retries.max_attempts = 3;
    config.retries.base_delay_ms = 10;
    config.retries.max_delay_ms = 50;
    config.dispatcher.push_timeout_secs = 5;
    config.dispatcher.command_timeout_secs = 5;
    config.dispatcher.fleet_deadline_secs = 10;
    config.heartbeat.interval_secs = 1;
    config.heartbeat.probe_timeout_secs = 1;
    config.admin.api_key = "test-key".into();
    config
}

pub struct Harness {
    pub services: Services,
    pub transport: Arc<FakeTransport>,
    pub source: Arc<FakeSource>,
}

impl Harness {
    pub fn new(model: ModelSnapshot) -> Self {
        Self::with_config(model, test_config())
    }

    pub fn with_config(model: ModelSnapshot, config: FleetConfig) -> Self {
        let store = Arc::new(ModelStore::with_snapshot(model, None));
        let transport = FakeTransport::new();
        let source = FakeSource::new();
        let services = Services::assemble(config, store, transport.clone(), source.clone());
        Self {
            services,
            transport,
            source,
        }
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.services.store
    }
}
