//! Config compilation subsystem.
//!
//! # Data Flow
//! ```text
//! ModelSnapshot (one atomic load)
//!     → rules::resolve → Resolution (table + groups + nodes, versioned)
//!     → TargetFormat::compile
//!         → routing_engine.rs   (ordered YAML lists)
//!         → forwarding_proxy.rs (INI sections, line directives)
//!         → dns_router.rs       (one ordered DNS sequence)
//!     → overlay appended verbatim
//!     → Artifact (content + sha256)
//! generator.rs caches artifacts per (snapshot version, format)
//! ```
//!
//! # Design Decisions
//! - A closed enum of formats; each variant owns one render function over the
//!   same input type
//! - Rendering is pure and deterministic: identical input gives byte-identical
//!   output, which is what makes hash-based push skipping sound
//! - No timestamps or random values ever enter `content`

pub mod artifact;
pub mod dns_router;
pub mod forwarding_proxy;
pub mod generator;
pub mod routing_engine;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CompilersConfig;
use crate::model::{Node, Target};
use crate::rules::{Resolution, ResolvedMember};

pub use artifact::Artifact;
pub use generator::{GenerationError, Generator};

/// Closed set of artifact formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetFormat {
    /// Clash/mihomo-style YAML.
    RoutingEngine,
    /// Surge-style INI.
    ForwardingProxy,
    /// mosdns-style YAML.
    DnsRouter,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 3] = [Self::RoutingEngine, Self::ForwardingProxy, Self::DnsRouter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoutingEngine => "routing-engine",
            Self::ForwardingProxy => "forwarding-proxy",
            Self::DnsRouter => "dns-router",
        }
    }

    /// MIME type used when serving the artifact.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::RoutingEngine | Self::DnsRouter => "application/yaml; charset=utf-8",
            Self::ForwardingProxy => "text/plain; charset=utf-8",
        }
    }

    /// Render the artifact for this format.
    pub fn compile(&self, input: &CompileInput<'_>) -> Result<Artifact, CompileError> {
        let rendered = match self {
            Self::RoutingEngine => routing_engine::render(input)?,
            Self::ForwardingProxy => forwarding_proxy::render(input)?,
            Self::DnsRouter => dns_router::render(input)?,
        };
        let mut content = rendered.content;
        append_overlay(&mut content, input.overlay);
        Ok(Artifact::new(
            *self,
            content,
            input.resolution.version(),
            rendered.dropped,
        ))
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "routing-engine" | "mihomo" | "clash" => Ok(Self::RoutingEngine),
            "forwarding-proxy" | "surge" => Ok(Self::ForwardingProxy),
            "dns-router" | "mosdns" => Ok(Self::DnsRouter),
            other => Err(format!("unknown target format '{}'", other)),
        }
    }
}

/// Everything a compiler reads.
#[derive(Clone, Copy)]
pub struct CompileInput<'a> {
    pub resolution: &'a Resolution,
    /// Operator-supplied raw fragment; appended, never validated.
    pub overlay: Option<&'a str>,
    pub settings: &'a CompilersConfig,
}

/// Compiler failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    /// A group lost every node this format can express.
    #[error("{format}: proxy group '{group}' has no node representable in this format")]
    UnresolvedGroup { format: TargetFormat, group: String },

    /// A matcher kind with no representation in the format.
    #[error("{format}: matcher '{matcher}' from rule '{rule}' is not supported")]
    UnsupportedMatcher {
        format: TargetFormat,
        matcher: String,
        rule: String,
    },
}

/// Render output before overlay and hashing.
pub(crate) struct Rendered {
    pub content: String,
    /// Human-readable notes on lossy translation.
    pub dropped: Vec<String>,
}

pub(crate) const OVERLAY_SEPARATOR: &str = "# ---- custom overlay ----";

fn append_overlay(content: &mut String, overlay: Option<&str>) {
    let Some(text) = overlay.filter(|t| !t.trim().is_empty()) else {
        return;
    };
    if !content.ends_with('\n') {
        content.push('\n');
    }
    content.push('\n');
    content.push_str(OVERLAY_SEPARATOR);
    content.push('\n');
    content.push_str(text);
    if !text.ends_with('\n') {
        content.push('\n');
    }
}

/// Policy name of a rule target.
pub(crate) fn policy_name(target: &Target) -> &str {
    match target {
        Target::Direct => "DIRECT",
        Target::Reject => "REJECT",
        Target::Group(name) => name.as_str(),
    }
}

/// Unique display names for the nodes of one artifact.
///
/// Names are assigned in node order; a name that repeats, or collides with a
/// group or a built-in policy, gets a ` #n` suffix.
pub(crate) struct NodeNames {
    by_id: HashMap<String, String>,
}

impl NodeNames {
    pub fn build<'a>(
        nodes: impl IntoIterator<Item = &'a Node>,
        group_names: impl IntoIterator<Item = &'a str>,
        sanitize: fn(&str) -> String,
    ) -> Self {
        let mut taken: HashSet<String> = group_names.into_iter().map(str::to_string).collect();
        taken.insert("DIRECT".into());
        taken.insert("REJECT".into());

        let mut by_id = HashMap::new();
        for node in nodes {
            let base = sanitize(&node.name);
            let mut name = base.clone();
            let mut n = 2;
            while taken.contains(&name) {
                name = format!("{} #{}", base, n);
                n += 1;
            }
            taken.insert(name.clone());
            by_id.insert(node.id.clone(), name);
        }
        Self { by_id }
    }

    pub fn get(&self, node_id: &str) -> Option<&str> {
        self.by_id.get(node_id).map(String::as_str)
    }

    /// Display name of a group member; `None` for members not in this artifact.
    pub fn member<'a>(&'a self, member: &'a ResolvedMember) -> Option<&'a str> {
        match member {
            ResolvedMember::Node(id) => self.get(id),
            ResolvedMember::Group(name) => Some(name.as_str()),
            ResolvedMember::Direct => Some("DIRECT"),
            ResolvedMember::Reject => Some("REJECT"),
        }
    }
}

/// YAML scalar: plain when unambiguous, otherwise a JSON (double-quoted)
/// string, which YAML reads identically.
///
/// Anything starting with a digit is quoted: YAML 1.1 loaders resolve hex,
/// octal, underscored and sexagesimal numbers and timestamps from plain scalars.
pub(crate) fn yaml_str(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '*'))
        && !s.starts_with(|c: char| c.is_ascii_digit() || matches!(c, '-' | '.' | '*'))
        && !matches!(
            s.to_ascii_lowercase().as_str(),
            "true" | "false" | "yes" | "no" | "on" | "off" | "null" | "y" | "n"
        )
        && s.parse::<f64>().is_err();
    if plain {
        s.to_string()
    } else {
        serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
    }
}

/// YAML scalar for block context (sequence items), where commas are plain.
pub(crate) fn yaml_line(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || s.contains(": ")
        || s.contains(" #")
        || s.ends_with(':')
        || s.ends_with(' ')
        || s.starts_with([
            '-', '?', ':', ',', '[', ']', '{', '}', '#', '&', '*', '!', '|', '>', '\'', '"', '%', '@', '`', ' ',
        ]);
    if needs_quotes {
        serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
    } else {
        s.to_string()
    }
}

/// Value inside a YAML flow mapping. JSON is valid flow YAML.
pub(crate) fn yaml_flow_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => yaml_str(s),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_line_keeps_commas_plain() {
        assert_eq!(yaml_line("DOMAIN,ads.example.com,REJECT"), "DOMAIN,ads.example.com,REJECT");
        assert_eq!(yaml_line("DOMAIN-REGEX,^a: b,DIRECT"), "\"DOMAIN-REGEX,^a: b,DIRECT\"");
    }

    #[test]
    fn test_yaml_str_quotes_when_needed() {
        assert_eq!(yaml_str("Proxy"), "Proxy");
        assert_eq!(yaml_str("HK 01"), "\"HK 01\"");
        assert_eq!(yaml_str("true"), "\"true\"");
        assert_eq!(yaml_str("7890"), "\"7890\"");
        assert_eq!(yaml_str("a: b"), "\"a: b\"");
        assert_eq!(yaml_str("0x1F"), "\"0x1F\"");
        assert_eq!(yaml_str("1_000"), "\"1_000\"");
        assert_eq!(yaml_str("2024-01-01"), "\"2024-01-01\"");
        assert_eq!(yaml_str("0o17"), "\"0o17\"");
        assert_eq!(yaml_str("inf"), "\"inf\"");
        assert_eq!(yaml_str("node-1_a"), "node-1_a");
    }

    #[test]
    fn test_format_names() {
        for format in TargetFormat::ALL {
            assert_eq!(format.as_str().parse::<TargetFormat>().unwrap(), format);
        }
        assert_eq!("surge".parse::<TargetFormat>().unwrap(), TargetFormat::ForwardingProxy);
        assert_eq!(
            serde_json::to_string(&TargetFormat::DnsRouter).unwrap(),
            "\"dns-router\""
        );
    }

    #[test]
    fn test_overlay_appended_after_separator() {
        let mut content = String::from("a: 1");
        append_overlay(&mut content, Some("b: 2"));
        assert_eq!(content, format!("a: 1\n\n{}\nb: 2\n", OVERLAY_SEPARATOR));

        let mut untouched = String::from("a: 1\n");
        append_overlay(&mut untouched, Some("   "));
        assert_eq!(untouched, "a: 1\n");
    }
}
