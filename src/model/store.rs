//! In-process canonical model store.
//!
//! # Responsibilities
//! - Hold every entity in one immutable, versioned snapshot
//! - Apply writes copy-on-write and publish them with a single atomic swap
//! - Persist the model as JSON and reload it from disk
//!
//! # Design Decisions
//! - Readers never lock: `snapshot()` is one `ArcSwap` load, so a generation
//!   run sees either the pre-edit or post-edit model, never a mix
//! - Writers are serialised by a mutex so no write is lost between the clone
//!   and the swap
//! - Every write bumps `version`; cached artifacts keyed by an older version
//!   are stale by construction

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compile::TargetFormat;
use crate::model::types::{Agent, Aggregation, GroupMember, Node, NodeSource, ProxyGroup, Rule, RuleSet, Subscription};

/// Errors raised by store writes and persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One consistent view of the whole model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSnapshot {
    /// Monotonic write counter; not persisted.
    #[serde(skip)]
    pub version: u64,
    pub subscriptions: Vec<Subscription>,
    pub nodes: Vec<Node>,
    pub rules: Vec<Rule>,
    pub rule_sets: Vec<RuleSet>,
    pub groups: Vec<ProxyGroup>,
    pub aggregations: Vec<Aggregation>,
    pub agents: Vec<Agent>,
    /// Operator-supplied raw fragment appended to each format's artifact.
    pub overlays: BTreeMap<TargetFormat, String>,
}

impl ModelSnapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn subscription(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    pub fn group(&self, name: &str) -> Option<&ProxyGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn aggregation(&self, id: &str) -> Option<&Aggregation> {
        self.aggregations.iter().find(|a| a.id == id)
    }

    /// Copy safe to hand out: subscription URLs and agent tokens masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for sub in &mut copy.subscriptions {
            sub.url = REDACTED.to_string();
        }
        for agent in &mut copy.agents {
            agent.token = REDACTED.to_string();
        }
        copy
    }

    /// True for a model produced by [`redacted`](Self::redacted).
    pub fn is_redacted(&self) -> bool {
        self.subscriptions.iter().any(|s| s.url == REDACTED) || self.agents.iter().any(|a| a.token == REDACTED)
    }

    /// Drop every group reference to an aggregation.
    fn unlink_aggregation(&mut self, id: &str) {
        for group in &mut self.groups {
            let before = group.members.len();
            group
                .members
                .retain(|m| !matches!(m, GroupMember::Aggregation(a) if a == id));
            if group.members.len() != before {
                tracing::info!(group = %group.name, aggregation = id, "Removed aggregation from proxy group");
            }
        }
    }

    pub fn overlay(&self, format: TargetFormat) -> Option<&str> {
        self.overlays.get(&format).map(String::as_str)
    }

    /// Nodes derived from a subscription, in store order.
    pub fn subscription_nodes<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.subscription_id() == Some(id))
    }

    fn agent_mut(&mut self, id: &str) -> Result<&mut Agent, StoreError> {
        self.agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| not_found("agent", id))
    }
}

/// Copy-on-write store of [`ModelSnapshot`]s.
pub struct ModelStore {
    current: ArcSwap<ModelSnapshot>,
    write_lock: Mutex<()>,
    path: Option<PathBuf>,
}

impl ModelStore {
    /// Empty store without persistence.
    pub fn in_memory() -> Self {
        Self::with_snapshot(ModelSnapshot::default(), None)
    }

    /// Store seeded from an existing model.
    pub fn with_snapshot(mut snapshot: ModelSnapshot, path: Option<PathBuf>) -> Self {
        snapshot.version = snapshot.version.max(1);
        Self {
            current: ArcSwap::from_pointee(snapshot),
            write_lock: Mutex::new(()),
            path,
        }
    }

    /// Open a persisted store; a missing file yields an empty model that will
    /// be created on the first write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            read_snapshot(&path)?
        } else {
            tracing::info!(path = %path.display(), "Model file not found, starting empty");
            ModelSnapshot::default()
        };
        tracing::info!(
            path = %path.display(),
            nodes = snapshot.nodes.len(),
            rules = snapshot.rules.len(),
            agents = snapshot.agents.len(),
            "Model store loaded"
        );
        Ok(Self::with_snapshot(snapshot, Some(path)))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current consistent snapshot.
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Apply `f` to a private copy of the model and publish it atomically.
    ///
    /// Returns the new version. If `f` fails nothing is published.
    pub fn update<F>(&self, f: F) -> Result<u64, StoreError>
    where
        F: FnOnce(&mut ModelSnapshot) -> Result<(), StoreError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = ModelSnapshot::clone(&self.current.load());
        f(&mut next)?;
        next.version += 1;
        let version = next.version;

        if let Some(path) = &self.path {
            write_snapshot(path, &next)?;
        }
        self.current.store(Arc::new(next));
        tracing::debug!(version, "Model updated");
        Ok(version)
    }

    /// Replace the whole model, persisting it first. Bumps the version.
    pub fn replace_all(&self, snapshot: ModelSnapshot) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = &self.path {
            write_snapshot(path, &snapshot)?;
        }
        let version = self.publish(snapshot);
        tracing::info!(version, "Model replaced");
        Ok(version)
    }

    /// Re-read the backing file and swap it in.
    ///
    /// Returns `None` when the file matches the current model, which is the
    /// case for events caused by this store's own writes.
    pub fn reload(&self) -> Result<Option<u64>, StoreError> {
        let path = self.path.as_ref().ok_or(StoreError::Invalid {
            kind: "store",
            reason: "store has no backing file".into(),
        })?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshot = read_snapshot(path)?;
        let current = self.current.load();
        snapshot.version = current.version;
        if snapshot == **current {
            return Ok(None);
        }
        Ok(Some(self.publish(snapshot)))
    }

    fn publish(&self, mut next: ModelSnapshot) -> u64 {
        next.version = self.current.load().version + 1;
        let version = next.version;
        self.current.store(Arc::new(next));
        version
    }

    // --- Nodes ---

    pub fn upsert_node(&self, node: Node) -> Result<u64, StoreError> {
        if node.server.trim().is_empty() || node.port == 0 {
            return Err(StoreError::Invalid {
                kind: "node",
                reason: format!("node '{}' needs a server and a non-zero port", node.id),
            });
        }
        self.update(|m| {
            upsert_by(&mut m.nodes, node, |a, b| a.id == b.id);
            Ok(())
        })
    }

    pub fn remove_node(&self, id: &str) -> Result<u64, StoreError> {
        self.update(|m| remove_by(&mut m.nodes, |n| n.id == id).ok_or_else(|| not_found("node", id)))
    }

    // --- Subscriptions ---

    pub fn upsert_subscription(&self, sub: Subscription) -> Result<u64, StoreError> {
        self.update(|m| {
            upsert_by(&mut m.subscriptions, sub, |a, b| a.id == b.id);
            Ok(())
        })
    }

    /// Delete a subscription and its derived nodes. Pinned nodes survive as
    /// manual nodes.
    pub fn remove_subscription(&self, id: &str) -> Result<u64, StoreError> {
        self.update(|m| {
            remove_by(&mut m.subscriptions, |s| s.id == id).ok_or_else(|| not_found("subscription", id))?;
            m.nodes.retain(|n| n.subscription_id() != Some(id) || n.pinned);
            for node in m.nodes.iter_mut().filter(|n| n.subscription_id() == Some(id)) {
                node.source = NodeSource::Manual;
            }
            Ok(())
        })
    }

    /// Atomically swap the derived node set of a subscription and record the
    /// fetch metadata. Pinned nodes keep their stored form.
    pub fn replace_subscription_nodes(
        &self,
        id: &str,
        nodes: Vec<Node>,
        body_hash: String,
        fetched_at: u64,
    ) -> Result<u64, StoreError> {
        self.update(|m| {
            let node_count = nodes.len();
            let sub = m
                .subscriptions
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| not_found("subscription", id))?;
            sub.last_hash = Some(body_hash);
            sub.last_fetched_at = Some(fetched_at);
            sub.node_count = node_count;

            m.nodes.retain(|n| n.subscription_id() != Some(id) || n.pinned);
            for node in nodes {
                if !m.nodes.iter().any(|n| n.id == node.id) {
                    m.nodes.push(node);
                }
            }
            Ok(())
        })
    }

    // --- Rules ---

    pub fn upsert_rule(&self, rule: Rule) -> Result<u64, StoreError> {
        self.update(|m| {
            upsert_by(&mut m.rules, rule, |a, b| a.id == b.id);
            Ok(())
        })
    }

    pub fn remove_rule(&self, id: &str) -> Result<u64, StoreError> {
        self.update(|m| remove_by(&mut m.rules, |r| r.id == id).ok_or_else(|| not_found("rule", id)))
    }

    pub fn upsert_rule_set(&self, set: RuleSet) -> Result<u64, StoreError> {
        self.update(|m| {
            upsert_by(&mut m.rule_sets, set, |a, b| a.name == b.name);
            Ok(())
        })
    }

    pub fn remove_rule_set(&self, name: &str) -> Result<u64, StoreError> {
        self.update(|m| {
            remove_by(&mut m.rule_sets, |s| s.name == name).ok_or_else(|| not_found("rule set", name))
        })
    }

    // --- Proxy groups ---

    pub fn upsert_group(&self, group: ProxyGroup) -> Result<u64, StoreError> {
        if group.name.trim().is_empty() {
            return Err(StoreError::Invalid {
                kind: "proxy group",
                reason: "name must not be empty".into(),
            });
        }
        self.update(|m| {
            upsert_by(&mut m.groups, group, |a, b| a.name == b.name);
            Ok(())
        })
    }

    pub fn remove_group(&self, name: &str) -> Result<u64, StoreError> {
        self.update(|m| remove_by(&mut m.groups, |g| g.name == name).ok_or_else(|| not_found("proxy group", name)))
    }

    // --- Aggregations ---

    /// Insert or replace an aggregation. Disabling one also removes it from
    /// every proxy group.
    pub fn upsert_aggregation(&self, aggregation: Aggregation) -> Result<u64, StoreError> {
        if aggregation.id.trim().is_empty() || aggregation.name.trim().is_empty() {
            return Err(StoreError::Invalid {
                kind: "aggregation",
                reason: "id and name must not be empty".into(),
            });
        }
        if let Some(pattern) = aggregation.filter_pattern() {
            regex::Regex::new(pattern).map_err(|e| StoreError::Invalid {
                kind: "aggregation",
                reason: format!("regex_filter: {}", e),
            })?;
        }
        self.update(|m| {
            if !aggregation.enabled {
                m.unlink_aggregation(&aggregation.id);
            }
            upsert_by(&mut m.aggregations, aggregation, |a, b| a.id == b.id);
            Ok(())
        })
    }

    /// Delete an aggregation and every group reference to it.
    pub fn remove_aggregation(&self, id: &str) -> Result<u64, StoreError> {
        self.update(|m| {
            remove_by(&mut m.aggregations, |a| a.id == id).ok_or_else(|| not_found("aggregation", id))?;
            m.unlink_aggregation(id);
            Ok(())
        })
    }

    // --- Agents ---

    pub fn upsert_agent(&self, agent: Agent) -> Result<u64, StoreError> {
        self.update(|m| {
            upsert_by(&mut m.agents, agent, |a, b| a.id == b.id);
            Ok(())
        })
    }

    pub fn remove_agent(&self, id: &str) -> Result<u64, StoreError> {
        self.update(|m| remove_by(&mut m.agents, |a| a.id == id).ok_or_else(|| not_found("agent", id)))
    }

    /// Remember the hash an agent acknowledged for a format.
    pub fn record_push(&self, agent_id: &str, format: TargetFormat, hash: &str) -> Result<u64, StoreError> {
        self.update(|m| {
            m.agent_mut(agent_id)?.last_pushed.insert(format, hash.to_string());
            Ok(())
        })
    }

    pub fn set_agent_disabled(&self, agent_id: &str, disabled: bool) -> Result<u64, StoreError> {
        self.update(|m| {
            m.agent_mut(agent_id)?.disabled = disabled;
            Ok(())
        })
    }

    pub fn set_agent_version(&self, agent_id: &str, version: Option<String>) -> Result<u64, StoreError> {
        self.update(|m| {
            m.agent_mut(agent_id)?.version = version;
            Ok(())
        })
    }

    // --- Overlays ---

    /// Set or clear (empty text) the overlay of a format.
    pub fn set_overlay(&self, format: TargetFormat, text: &str) -> Result<u64, StoreError> {
        self.update(|m| {
            if text.trim().is_empty() {
                m.overlays.remove(&format);
            } else {
                m.overlays.insert(format, text.to_string());
            }
            Ok(())
        })
    }
}

const REDACTED: &str = "***";

fn not_found(kind: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn upsert_by<T>(items: &mut Vec<T>, item: T, same: impl Fn(&T, &T) -> bool) {
    match items.iter_mut().find(|existing| same(existing, &item)) {
        Some(slot) => *slot = item,
        None => items.push(item),
    }
}

fn remove_by<T>(items: &mut Vec<T>, pred: impl Fn(&T) -> bool) -> Option<()> {
    let idx = items.iter().position(pred)?;
    items.remove(idx);
    Some(())
}

fn read_snapshot(path: &Path) -> Result<ModelSnapshot, StoreError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Write to a sibling temp file then rename, so readers of the file never see
/// a half-written model.
fn write_snapshot(path: &Path, snapshot: &ModelSnapshot) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp)?;
        serde_json::to_writer_pretty(BufWriter::new(file), snapshot)?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
