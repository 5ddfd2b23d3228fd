//! Canonical entity definitions.
//!
//! All types derive Serde traits so the store can persist them as JSON and
//! the admin API can accept them verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rules::matcher::Matcher;

/// Proxy protocol of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(rename = "ss")]
    Shadowsocks,
    #[serde(rename = "ssr")]
    ShadowsocksR,
    Vmess,
    Vless,
    Trojan,
    Hysteria,
    Hysteria2,
    Http,
    Socks5,
}

impl Protocol {
    /// Wire name shared by the subscription formats and the routing-engine format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shadowsocks => "ss",
            Self::ShadowsocksR => "ssr",
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Hysteria => "hysteria",
            Self::Hysteria2 => "hysteria2",
            Self::Http => "http",
            Self::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ss" | "shadowsocks" => Ok(Self::Shadowsocks),
            "ssr" | "shadowsocksr" => Ok(Self::ShadowsocksR),
            "vmess" => Ok(Self::Vmess),
            "vless" => Ok(Self::Vless),
            "trojan" => Ok(Self::Trojan),
            "hysteria" => Ok(Self::Hysteria),
            "hysteria2" | "hy2" => Ok(Self::Hysteria2),
            "http" | "https" => Ok(Self::Http),
            "socks5" | "socks" => Ok(Self::Socks5),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Where a node came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSource {
    Manual,
    Subscription { id: String },
}

/// One proxy server endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub server: String,
    pub port: u16,

    /// Protocol parameters (credentials, transport options), ordered for
    /// deterministic rendering.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    #[serde(default = "manual_source")]
    pub source: NodeSource,

    /// Pinned nodes survive deletion of their subscription.
    #[serde(default)]
    pub pinned: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl Node {
    /// Identity used for deduplication: (address, port, protocol).
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            server: self.server.to_ascii_lowercase(),
            port: self.port,
            protocol: self.protocol,
        }
    }

    /// String-valued parameter, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Scalar parameter rendered as text (numbers included).
    pub fn param_text(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Boolean parameter; accepts `true`, `"true"` and `1`.
    pub fn param_bool(&self, key: &str) -> bool {
        match self.params.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true" || s == "1",
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            _ => false,
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match &self.source {
            NodeSource::Subscription { id } => Some(id),
            NodeSource::Manual => None,
        }
    }
}

/// Deduplication key of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity {
    pub server: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.server, self.port)
    }
}

/// A remote node list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Unix seconds of the last successful fetch.
    #[serde(default)]
    pub last_fetched_at: Option<u64>,

    /// sha256 of the last fetched body.
    #[serde(default)]
    pub last_hash: Option<String>,

    #[serde(default)]
    pub node_count: usize,
}

/// Named node pool drawn from subscriptions and hand-picked nodes.
///
/// Expanded at resolution time, so it follows subscription refreshes without
/// being edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub id: String,
    pub name: String,

    /// Subscription ids whose nodes are included, in this order.
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Extra node ids; a node whose name is already present is skipped.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Keep only nodes whose name matches this pattern.
    #[serde(default)]
    pub regex_filter: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Aggregation {
    pub fn filter_pattern(&self) -> Option<&str> {
        self.regex_filter.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }
}

/// Routing decision of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Direct,
    Reject,
    Group(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Reject => f.write_str("reject"),
            Self::Group(name) => write!(f, "group:{}", name),
        }
    }
}

/// What a rule matches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Matcher { matcher: Matcher },
    RuleSet { name: String },
}

/// One ordered routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,

    /// Total order key; lower is evaluated first.
    pub position: u32,

    pub kind: RuleKind,
    pub target: Target,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Reusable ordered bundle of matchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    pub matchers: Vec<Matcher>,
}

impl RuleSet {
    /// Parse the classical line format (`DOMAIN-SUFFIX,example.com`).
    ///
    /// Blank lines and `#`/`//` comments are ignored. Trailing policy fields
    /// and options are ignored since rule sets carry no target.
    pub fn parse_classical(name: impl Into<String>, text: &str) -> Result<Self, String> {
        let mut matchers = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let matcher = Matcher::parse_line(line)
                .map_err(|e| format!("line {}: {}", idx + 1, e))?;
            matchers.push(matcher);
        }
        Ok(Self {
            name: name.into(),
            matchers,
        })
    }
}

/// Selection strategy of a proxy group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Select,
    UrlTest,
    Fallback,
    LoadBalance,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::UrlTest => "url-test",
            Self::Fallback => "fallback",
            Self::LoadBalance => "load-balance",
        }
    }

    /// Whether the strategy probes members with a test URL.
    pub fn is_probing(&self) -> bool {
        !matches!(self, Self::Select)
    }
}

/// A member reference inside a proxy group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum GroupMember {
    Node(String),
    Subscription(String),
    /// Aggregation id.
    Aggregation(String),
    Group(String),
    Direct,
    Reject,
}

/// Named, strategy-bearing collection of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyGroup {
    pub name: String,
    pub strategy: Strategy,
    pub members: Vec<GroupMember>,

    #[serde(default)]
    pub test_url: Option<String>,

    #[serde(default)]
    pub interval_secs: Option<u32>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A managed remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,

    /// Bearer token the agent expects.
    #[serde(default)]
    pub token: String,

    /// Artifact formats this agent runs.
    pub formats: Vec<crate::compile::TargetFormat>,

    /// Remote log files that may be read or cleared.
    #[serde(default)]
    pub log_paths: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Set once an uninstall succeeded.
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub version: Option<String>,

    /// Last acknowledged artifact hash per format.
    #[serde(default)]
    pub last_pushed: BTreeMap<crate::compile::TargetFormat, String>,
}

impl Agent {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn serves(&self, format: crate::compile::TargetFormat) -> bool {
        self.formats.contains(&format)
    }
}

fn default_true() -> bool {
    true
}

fn manual_source() -> NodeSource {
    NodeSource::Manual
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::matcher::Matcher;

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("SS".parse::<Protocol>().unwrap(), Protocol::Shadowsocks);
        assert_eq!("hy2".parse::<Protocol>().unwrap(), Protocol::Hysteria2);
        assert!("wireguard".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_identity_ignores_name_and_case() {
        let a = Node {
            id: "a".into(),
            name: "HK 1".into(),
            protocol: Protocol::Trojan,
            server: "Edge.Example.com".into(),
            port: 443,
            params: BTreeMap::new(),
            source: NodeSource::Manual,
            pinned: false,
            enabled: true,
            tags: vec![],
        };
        let mut b = a.clone();
        b.name = "HK 2".into();
        b.server = "edge.example.com".into();
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_group_member_wire_form() {
        let member: GroupMember = serde_json::from_str(r#"{"kind":"aggregation","ref":"agg-hk"}"#).unwrap();
        assert_eq!(member, GroupMember::Aggregation("agg-hk".into()));

        let agg: Aggregation = serde_json::from_str(r#"{"id":"a","name":"HK","regex_filter":"  "}"#).unwrap();
        assert!(agg.enabled);
        assert_eq!(agg.filter_pattern(), None);
    }

    #[test]
    fn test_rule_set_classical() {
        let text = "# ads\nDOMAIN-SUFFIX,ads.example.com\n\nDOMAIN-KEYWORD,tracker\nIP-CIDR,10.0.0.0/8,no-resolve\n";
        let set = RuleSet::parse_classical("ads", text).unwrap();
        assert_eq!(set.matchers.len(), 3);
        assert_eq!(set.matchers[0], Matcher::DomainSuffix("ads.example.com".into()));
    }

    #[test]
    fn test_rule_set_reports_bad_line() {
        let err = RuleSet::parse_classical("x", "DOMAIN,a.com\nBOGUS,1\n").unwrap_err();
        assert!(err.contains("line 2"));
    }
}
