//! Rule resolution.
//!
//! Turns the relational rule/group/node model of one snapshot into a
//! [`Resolution`]: the expanded routing table plus the proxy groups and
//! nodes the compilers need. Resolution either succeeds completely or fails;
//! no partial table is ever returned.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use thiserror::Error;

use crate::model::{
    Aggregation, GroupMember, ModelSnapshot, Node, ProxyGroup, Rule, RuleKind, RuleSet, Strategy, Target,
};
use crate::rules::matcher::Matcher;
use crate::rules::table::{Route, RouteOrigin, RoutingTable};

/// Errors that block generation of every artifact.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// A proxy group reaches no live node.
    #[error("proxy group '{group}' resolves to no live node (referenced by rule {})", .rule.as_deref().unwrap_or("<none>"))]
    UnresolvedGroup { group: String, rule: Option<String> },

    /// A rule references a rule set that does not exist.
    #[error("rule '{rule}' references unknown rule set '{rule_set}'")]
    UnknownRuleSet { rule: String, rule_set: String },

    /// Two enabled rules claim the same position.
    #[error("rules '{first}' and '{second}' share position {position}")]
    AmbiguousOrder {
        position: u32,
        first: String,
        second: String,
    },

    /// Group membership loops back on itself.
    #[error("proxy group '{group}' is part of a membership cycle")]
    GroupCycle { group: String },

    /// A matcher that cannot be evaluated (bad regex).
    #[error("rule '{rule}' has an invalid matcher: {reason}")]
    InvalidMatcher { rule: String, reason: String },

    /// An aggregation's name filter does not compile.
    #[error("aggregation '{aggregation}' has an invalid filter: {reason}")]
    InvalidAggregation { aggregation: String, reason: String },
}

/// A live member of a resolved group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedMember {
    /// Node id.
    Node(String),
    /// Nested group name.
    Group(String),
    Direct,
    Reject,
}

/// Proxy group with dead members removed and subscriptions expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedGroup {
    pub name: String,
    pub strategy: Strategy,
    pub members: Vec<ResolvedMember>,
    pub test_url: Option<String>,
    pub interval_secs: Option<u32>,
}

/// Everything a compiler needs, computed from one snapshot.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub table: RoutingTable,
    /// Enabled groups in declaration order.
    pub groups: Vec<ResolvedGroup>,
    /// Live nodes referenced by `groups`, in store order.
    pub nodes: Vec<Node>,
}

impl Resolution {
    pub fn version(&self) -> u64 {
        self.table.version()
    }
}

/// Resolve a full snapshot.
pub fn resolve(snapshot: &ModelSnapshot) -> Result<Resolution, ResolveError> {
    resolve_parts(
        &snapshot.rules,
        &snapshot.rule_sets,
        &snapshot.groups,
        &snapshot.nodes,
        &snapshot.aggregations,
        snapshot.version,
    )
}

/// Resolve explicit parts of a model.
pub fn resolve_parts(
    rules: &[Rule],
    rule_sets: &[RuleSet],
    groups: &[ProxyGroup],
    nodes: &[Node],
    aggregations: &[Aggregation],
    version: u64,
) -> Result<Resolution, ResolveError> {
    let graph = GroupGraph::new(groups, nodes, aggregations)?;

    let ordered = order_rules(rules)?;
    let sets: HashMap<&str, &RuleSet> = rule_sets.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut routes = Vec::new();
    for rule in ordered {
        if let Target::Group(name) = &rule.target {
            if !graph.is_live(name)? {
                return Err(ResolveError::UnresolvedGroup {
                    group: name.clone(),
                    rule: Some(rule.id.clone()),
                });
            }
        }

        match &rule.kind {
            RuleKind::Matcher { matcher } => {
                routes.push(make_route(rule, matcher.clone(), None)?);
            }
            RuleKind::RuleSet { name } => {
                let set = sets.get(name.as_str()).ok_or_else(|| ResolveError::UnknownRuleSet {
                    rule: rule.id.clone(),
                    rule_set: name.clone(),
                })?;
                if set.matchers.is_empty() {
                    tracing::warn!(rule = %rule.id, rule_set = %name, "Rule set is empty, rule expands to nothing");
                }
                for matcher in &set.matchers {
                    routes.push(make_route(rule, matcher.clone(), Some(name))?);
                }
            }
        }
    }

    match routes.iter().position(|r| r.matcher.is_final()) {
        Some(idx) if idx + 1 < routes.len() => {
            tracing::warn!(
                unreachable = routes.len() - idx - 1,
                final_rule = %routes[idx].origin.rule_id,
                "Routes after the catch-all can never match"
            );
        }
        Some(_) => {}
        None => {
            let origin = RouteOrigin {
                rule_id: String::from("implicit-final"),
                rule_set: None,
                implicit: true,
            };
            routes.push(Route::new(Matcher::Final, Target::Direct, origin).map_err(|e| {
                ResolveError::InvalidMatcher {
                    rule: String::from("implicit-final"),
                    reason: e.to_string(),
                }
            })?);
        }
    }

    // Every enabled group is emitted by the compilers, referenced or not.
    let mut resolved_groups = Vec::new();
    for group in groups.iter().filter(|g| g.enabled) {
        if !graph.is_live(&group.name)? {
            return Err(ResolveError::UnresolvedGroup {
                group: group.name.clone(),
                rule: None,
            });
        }
        resolved_groups.push(graph.resolve_members(group));
    }

    let used: HashSet<&str> = resolved_groups
        .iter()
        .flat_map(|g| g.members.iter())
        .filter_map(|m| match m {
            ResolvedMember::Node(id) => Some(id.as_str()),
            _ => None,
        })
        .collect();
    let used_nodes = nodes
        .iter()
        .filter(|n| n.enabled && used.contains(n.id.as_str()))
        .cloned()
        .collect();

    tracing::debug!(
        version,
        routes = routes.len(),
        groups = resolved_groups.len(),
        "Resolved routing table"
    );

    Ok(Resolution {
        table: RoutingTable::new(routes, version),
        groups: resolved_groups,
        nodes: used_nodes,
    })
}

/// Enabled rules sorted by position; shared positions are rejected.
fn order_rules(rules: &[Rule]) -> Result<Vec<&Rule>, ResolveError> {
    let mut ordered: Vec<&Rule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by_key(|r| r.position);
    for pair in ordered.windows(2) {
        if pair[0].position == pair[1].position {
            return Err(ResolveError::AmbiguousOrder {
                position: pair[0].position,
                first: pair[0].id.clone(),
                second: pair[1].id.clone(),
            });
        }
    }
    Ok(ordered)
}

fn make_route(rule: &Rule, matcher: Matcher, rule_set: Option<&String>) -> Result<Route, ResolveError> {
    let origin = RouteOrigin {
        rule_id: rule.id.clone(),
        rule_set: rule_set.cloned(),
        implicit: false,
    };
    Route::new(matcher.normalized(), rule.target.clone(), origin).map_err(|e| ResolveError::InvalidMatcher {
        rule: rule.id.clone(),
        reason: e.to_string(),
    })
}

/// Live nodes of an aggregation.
///
/// Subscription nodes come first in listed order, then the hand-picked
/// nodes whose names are not taken yet. The name filter applies to both.
pub fn expand_aggregation<'a>(aggregation: &Aggregation, nodes: &'a [Node]) -> Result<Vec<&'a Node>, ResolveError> {
    let filter = aggregation
        .filter_pattern()
        .map(Regex::new)
        .transpose()
        .map_err(|e| ResolveError::InvalidAggregation {
            aggregation: aggregation.id.clone(),
            reason: e.to_string(),
        })?;

    let live = || nodes.iter().filter(|n| n.enabled);
    let mut picked: Vec<&Node> = Vec::new();
    for sub in &aggregation.subscriptions {
        picked.extend(live().filter(|n| n.subscription_id() == Some(sub.as_str())));
    }
    let mut names: HashSet<&str> = picked.iter().map(|&n| n.name.as_str()).collect();
    for id in &aggregation.nodes {
        if let Some(node) = live().find(|n| &n.id == id) {
            if names.insert(node.name.as_str()) {
                picked.push(node);
            }
        }
    }

    if let Some(filter) = filter {
        picked.retain(|n| filter.is_match(&n.name));
    }
    Ok(picked)
}

/// Membership view over enabled groups and live nodes.
struct GroupGraph<'a> {
    groups: HashMap<&'a str, &'a ProxyGroup>,
    live_nodes: HashSet<&'a str>,
    by_subscription: HashMap<&'a str, Vec<&'a str>>,
    /// Enabled aggregations, already expanded to node ids.
    aggregations: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> GroupGraph<'a> {
    fn new(groups: &'a [ProxyGroup], nodes: &'a [Node], aggregations: &'a [Aggregation]) -> Result<Self, ResolveError> {
        let mut by_subscription: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut live_nodes = HashSet::new();
        for node in nodes.iter().filter(|n| n.enabled) {
            live_nodes.insert(node.id.as_str());
            if let Some(sub) = node.subscription_id() {
                by_subscription.entry(sub).or_default().push(node.id.as_str());
            }
        }
        let mut expanded = HashMap::new();
        for aggregation in aggregations.iter().filter(|a| a.enabled) {
            let ids = expand_aggregation(aggregation, nodes)?
                .into_iter()
                .map(|n| n.id.as_str())
                .collect();
            expanded.insert(aggregation.id.as_str(), ids);
        }
        Ok(Self {
            groups: groups
                .iter()
                .filter(|g| g.enabled)
                .map(|g| (g.name.as_str(), g))
                .collect(),
            live_nodes,
            by_subscription,
            aggregations: expanded,
        })
    }

    /// True if the group transitively reaches a live node.
    fn is_live(&self, name: &str) -> Result<bool, ResolveError> {
        let mut visiting = HashSet::new();
        self.reaches_node(name, &mut visiting)
    }

    fn reaches_node<'b>(&'b self, name: &'b str, visiting: &mut HashSet<&'b str>) -> Result<bool, ResolveError> {
        let Some(group) = self.groups.get(name) else {
            return Ok(false);
        };
        if !visiting.insert(name) {
            return Err(ResolveError::GroupCycle {
                group: name.to_string(),
            });
        }
        let mut live = false;
        for member in &group.members {
            live |= match member {
                GroupMember::Node(id) => self.live_nodes.contains(id.as_str()),
                GroupMember::Subscription(id) => self
                    .by_subscription
                    .get(id.as_str())
                    .is_some_and(|ids| !ids.is_empty()),
                GroupMember::Aggregation(id) => self
                    .aggregations
                    .get(id.as_str())
                    .is_some_and(|ids| !ids.is_empty()),
                GroupMember::Group(inner) => self.reaches_node(inner, visiting)?,
                GroupMember::Direct | GroupMember::Reject => false,
            };
        }
        visiting.remove(name);
        Ok(live)
    }

    fn resolve_members(&self, group: &ProxyGroup) -> ResolvedGroup {
        let mut members = Vec::new();
        for member in &group.members {
            match member {
                GroupMember::Node(id) if self.live_nodes.contains(id.as_str()) => {
                    members.push(ResolvedMember::Node(id.clone()));
                }
                GroupMember::Subscription(id) => {
                    if let Some(ids) = self.by_subscription.get(id.as_str()) {
                        members.extend(ids.iter().map(|n| ResolvedMember::Node(n.to_string())));
                    }
                }
                GroupMember::Aggregation(id) if self.aggregations.contains_key(id.as_str()) => {
                    if let Some(ids) = self.aggregations.get(id.as_str()) {
                        members.extend(ids.iter().map(|n| ResolvedMember::Node(n.to_string())));
                    }
                }
                GroupMember::Group(inner) if self.groups.contains_key(inner.as_str()) => {
                    members.push(ResolvedMember::Group(inner.clone()));
                }
                GroupMember::Direct => members.push(ResolvedMember::Direct),
                GroupMember::Reject => members.push(ResolvedMember::Reject),
                dead => {
                    tracing::debug!(group = %group.name, member = ?dead, "Dropping dead group member");
                }
            }
        }
        // A node reached through several members appears once.
        let mut seen = HashSet::new();
        members.retain(|m| match m {
            ResolvedMember::Node(id) => seen.insert(id.clone()),
            _ => true,
        });

        ResolvedGroup {
            name: group.name.clone(),
            strategy: group.strategy,
            members,
            test_url: group.test_url.clone(),
            interval_secs: group.interval_secs,
        }
    }
}
