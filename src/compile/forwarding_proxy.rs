//! Forwarding-proxy compiler (Surge-style INI).
//!
//! # Responsibilities
//! - Emit `[General]`, `[Proxy]`, `[Proxy Group]` and `[Rule]` sections
//! - Translate node parameters into `key=value` proxy directives
//! - Recheck group liveness against the nodes this format can express
//!
//! # Design Decisions
//! - vless, ssr and hysteria v1 have no directive here; such nodes are
//!   dropped and reported, and a group left without nodes fails the compile
//! - Regex domain matchers have no directive either and fail the compile
//! - Names cannot carry `,` or `=`; both are replaced before uniquifying

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::compile::{policy_name, CompileError, CompileInput, NodeNames, Rendered, TargetFormat};
use crate::config::ForwardingProxyConfig;
use crate::model::{Node, Protocol};
use crate::rules::{Matcher, ResolvedGroup, ResolvedMember, Route};

const FORMAT: TargetFormat = TargetFormat::ForwardingProxy;

pub(crate) fn render(input: &CompileInput<'_>) -> Result<Rendered, CompileError> {
    let resolution = input.resolution;
    let cfg = &input.settings.forwarding_proxy;
    let mut dropped = Vec::new();

    let mut proxy_lines: HashMap<&str, String> = HashMap::new();
    for node in &resolution.nodes {
        match proxy_directive(node) {
            Ok(directive) => {
                proxy_lines.insert(node.id.as_str(), directive);
            }
            Err(reason) => {
                tracing::warn!(node = %node.name, reason = %reason, "Dropping node from forwarding-proxy artifact");
                dropped.push(format!("node '{}': {}", node.name, reason));
            }
        }
    }

    let live = live_groups(&resolution.groups, &proxy_lines);
    if let Some(dead) = resolution.groups.iter().find(|g| !live.contains(g.name.as_str())) {
        return Err(CompileError::UnresolvedGroup {
            format: FORMAT,
            group: dead.name.clone(),
        });
    }

    let kept: Vec<&Node> = resolution
        .nodes
        .iter()
        .filter(|n| proxy_lines.contains_key(n.id.as_str()))
        .collect();
    let names = NodeNames::build(
        kept.iter().copied(),
        resolution.groups.iter().map(|g| g.name.as_str()),
        sanitize_name,
    );

    let mut out = String::new();
    if let Some(url) = cfg.managed_config_url.as_deref().filter(|u| !u.is_empty()) {
        out.push_str(&format!(
            "#!MANAGED-CONFIG {} interval={} strict=true\n\n",
            url, cfg.managed_interval_secs
        ));
    }

    out.push_str("[General]\n");
    for line in &cfg.general {
        out.push_str(line);
        out.push('\n');
    }

    out.push_str("\n[Proxy]\n");
    for node in &kept {
        let name = names.get(&node.id).unwrap_or(node.name.as_str());
        if let Some(directive) = proxy_lines.get(node.id.as_str()) {
            out.push_str(&format!("{} = {}\n", name, directive));
        }
    }

    out.push_str("\n[Proxy Group]\n");
    for group in &resolution.groups {
        out.push_str(&group_line(group, &names, cfg));
        out.push('\n');
    }

    out.push_str("\n[Rule]\n");
    for route in resolution.table.routes() {
        out.push_str(&rule_line(route)?);
        out.push('\n');
    }

    Ok(Rendered { content: out, dropped })
}

fn sanitize_name(name: &str) -> String {
    name.replace([',', '='], " ").trim().to_string()
}

/// Groups that still reach an expressible node, computed to a fixpoint.
fn live_groups<'a>(groups: &'a [ResolvedGroup], proxies: &HashMap<&str, String>) -> HashSet<&'a str> {
    let mut live = HashSet::new();
    loop {
        let before = live.len();
        for group in groups {
            if live.contains(group.name.as_str()) {
                continue;
            }
            let reaches = group.members.iter().any(|m| match m {
                ResolvedMember::Node(id) => proxies.contains_key(id.as_str()),
                ResolvedMember::Group(inner) => live.contains(inner.as_str()),
                ResolvedMember::Direct | ResolvedMember::Reject => false,
            });
            if reaches {
                live.insert(group.name.as_str());
            }
        }
        if live.len() == before {
            return live;
        }
    }
}

fn group_line(group: &ResolvedGroup, names: &NodeNames, cfg: &ForwardingProxyConfig) -> String {
    let mut parts = vec![group.strategy.as_str().to_string()];
    parts.extend(group.members.iter().filter_map(|m| names.member(m)).map(str::to_string));
    if group.strategy.is_probing() {
        let url = group.test_url.as_deref().unwrap_or(&cfg.test_url);
        let interval = group.interval_secs.unwrap_or(cfg.test_interval_secs);
        parts.push(format!("url={}", url));
        parts.push(format!("interval={}", interval));
    }
    format!("{} = {}", group.name, parts.join(", "))
}

fn rule_line(route: &Route) -> Result<String, CompileError> {
    let policy = policy_name(&route.target);
    let line = match &route.matcher {
        Matcher::Final => format!("FINAL,{}", policy),
        Matcher::DomainRegex(pattern) => {
            return Err(CompileError::UnsupportedMatcher {
                format: FORMAT,
                matcher: format!("DOMAIN-REGEX,{}", pattern),
                rule: route.origin.rule_id.clone(),
            });
        }
        Matcher::DstPort(port) => format!("DEST-PORT,{},{}", port, policy),
        m @ Matcher::IpCidr(_) => format!("{},{},{},no-resolve", m.type_name(), m.value(), policy),
        m => format!("{},{},{}", m.type_name(), m.value(), policy),
    };
    Ok(line)
}

/// Right-hand side of a `[Proxy]` line, or the reason the node cannot be expressed.
fn proxy_directive(node: &Node) -> Result<String, String> {
    let mut parts = Vec::new();
    match node.protocol {
        Protocol::Shadowsocks => {
            parts.push("ss".to_string());
            parts.push(node.server.clone());
            parts.push(node.port.to_string());
            let cipher = node.param_str("cipher").ok_or("missing cipher")?;
            parts.push(format!("encrypt-method={}", cipher));
            parts.push(format!("password={}", node.param_str("password").unwrap_or_default()));
            if let Some(plugin) = node.param_str("plugin") {
                if plugin != "obfs" && plugin != "simple-obfs" {
                    return Err(format!("unsupported shadowsocks plugin '{}'", plugin));
                }
                let opts = node.params.get("plugin-opts");
                if let Some(mode) = opts.and_then(|o| o.get("mode")).and_then(Value::as_str) {
                    parts.push(format!("obfs={}", mode));
                }
                if let Some(host) = opts.and_then(|o| o.get("host")).and_then(Value::as_str) {
                    parts.push(format!("obfs-host={}", host));
                }
            }
        }
        Protocol::Vmess => {
            parts.push("vmess".to_string());
            parts.push(node.server.clone());
            parts.push(node.port.to_string());
            let uuid = node.param_str("uuid").ok_or("missing uuid")?;
            parts.push(format!("username={}", uuid));
            if node.param_text("alterId").as_deref().unwrap_or("0") == "0" {
                parts.push("vmess-aead=true".to_string());
            }
            if node.param_bool("tls") {
                parts.push("tls=true".to_string());
                if let Some(sni) = node.param_str("servername").or_else(|| node.param_str("sni")) {
                    parts.push(format!("sni={}", sni));
                }
            }
            transport(node, &mut parts)?;
        }
        Protocol::Trojan => {
            parts.push("trojan".to_string());
            parts.push(node.server.clone());
            parts.push(node.port.to_string());
            parts.push(format!("password={}", node.param_str("password").unwrap_or_default()));
            if let Some(sni) = node.param_str("sni") {
                parts.push(format!("sni={}", sni));
            }
            transport(node, &mut parts)?;
        }
        Protocol::Hysteria2 => {
            parts.push("hysteria2".to_string());
            parts.push(node.server.clone());
            parts.push(node.port.to_string());
            parts.push(format!("password={}", node.param_str("password").unwrap_or_default()));
            if let Some(sni) = node.param_str("sni") {
                parts.push(format!("sni={}", sni));
            }
        }
        Protocol::Http | Protocol::Socks5 => {
            let tls = node.param_bool("tls");
            let kind = match (node.protocol, tls) {
                (Protocol::Http, false) => "http",
                (Protocol::Http, true) => "https",
                (_, false) => "socks5",
                (_, true) => "socks5-tls",
            };
            parts.push(kind.to_string());
            parts.push(node.server.clone());
            parts.push(node.port.to_string());
            if let Some(user) = node.param_str("username") {
                parts.push(user.to_string());
                parts.push(node.param_str("password").unwrap_or_default().to_string());
            }
        }
        Protocol::Vless | Protocol::ShadowsocksR | Protocol::Hysteria => {
            return Err(format!("protocol {} has no forwarding-proxy representation", node.protocol));
        }
    }

    if node.param_bool("skip-cert-verify") {
        parts.push("skip-cert-verify=true".to_string());
    }
    if node.param_bool("udp") {
        parts.push("udp-relay=true".to_string());
    }
    Ok(parts.join(", "))
}

/// Websocket transport directives; other transports are not expressible.
fn transport(node: &Node, parts: &mut Vec<String>) -> Result<(), String> {
    match node.param_str("network") {
        None | Some("tcp") => Ok(()),
        Some("ws") => {
            parts.push("ws=true".to_string());
            let opts = node.params.get("ws-opts");
            if let Some(path) = opts.and_then(|o| o.get("path")).and_then(Value::as_str) {
                parts.push(format!("ws-path={}", path));
            }
            let host = opts
                .and_then(|o| o.get("headers"))
                .and_then(|h| h.get("Host"))
                .and_then(Value::as_str);
            if let Some(host) = host {
                parts.push(format!("ws-headers=Host:{}", host));
            }
            Ok(())
        }
        Some(other) => Err(format!("unsupported transport '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilersConfig;
    use crate::model::{GroupMember, NodeSource, ProxyGroup, Rule, RuleKind, Strategy, Target};
    use crate::rules::resolve_parts;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn node(id: &str, name: &str, protocol: Protocol, params: Value) -> Node {
        let params: BTreeMap<String, Value> = serde_json::from_value(params).unwrap();
        Node {
            id: id.into(),
            name: name.into(),
            protocol,
            server: format!("{}.example.net", id),
            port: 443,
            params,
            source: NodeSource::Manual,
            pinned: false,
            enabled: true,
            tags: vec![],
        }
    }

    fn group(name: &str, strategy: Strategy, members: Vec<GroupMember>) -> ProxyGroup {
        ProxyGroup {
            name: name.into(),
            strategy,
            members,
            test_url: None,
            interval_secs: None,
            enabled: true,
        }
    }

    fn rule(id: &str, position: u32, matcher: Matcher, target: Target) -> Rule {
        Rule {
            id: id.into(),
            position,
            kind: RuleKind::Matcher { matcher },
            target,
            enabled: true,
        }
    }

    fn compile(rules: &[Rule], groups: &[ProxyGroup], nodes: &[Node]) -> Result<crate::compile::Artifact, CompileError> {
        let resolution = resolve_parts(rules, &[], groups, nodes, &[], 1).unwrap();
        let mut settings = CompilersConfig::default();
        settings.forwarding_proxy.general = vec!["loglevel = notify".into()];
        let input = CompileInput {
            resolution: &resolution,
            overlay: None,
            settings: &settings,
        };
        FORMAT.compile(&input)
    }

    #[test]
    fn test_renders_proxy_group_and_rules() {
        let nodes = vec![
            node("a", "HK, 01", Protocol::Shadowsocks, json!({"cipher": "aes-256-gcm", "password": "pw"})),
            node("b", "JP", Protocol::Trojan, json!({"password": "t", "sni": "jp.example.net", "skip-cert-verify": true})),
        ];
        let groups = vec![group(
            "Proxy",
            Strategy::Select,
            vec![GroupMember::Node("a".into()), GroupMember::Node("b".into()), GroupMember::Direct],
        )];
        let rules = vec![
            rule("r1", 1, Matcher::DomainSuffix("google.com".into()), Target::Group("Proxy".into())),
            rule("r2", 2, Matcher::DstPort(22), Target::Direct),
            rule("r3", 3, Matcher::Final, Target::Group("Proxy".into())),
        ];

        let artifact = compile(&rules, &groups, &nodes).unwrap();
        let expected = "[General]\nloglevel = notify\n\n[Proxy]\n\
            HK  01 = ss, a.example.net, 443, encrypt-method=aes-256-gcm, password=pw\n\
            JP = trojan, b.example.net, 443, password=t, sni=jp.example.net, skip-cert-verify=true\n\n\
            [Proxy Group]\nProxy = select, HK  01, JP, DIRECT\n\n\
            [Rule]\nDOMAIN-SUFFIX,google.com,Proxy\nDEST-PORT,22,DIRECT\nFINAL,Proxy\n";
        assert_eq!(artifact.content, expected);
        assert!(artifact.dropped.is_empty());
    }

    #[test]
    fn test_inexpressible_nodes_dropped_and_group_rechecked() {
        let nodes = vec![
            node("a", "V", Protocol::Vless, json!({"uuid": "u"})),
            node("b", "T", Protocol::Trojan, json!({"password": "t"})),
        ];
        let groups = vec![
            group("Mixed", Strategy::UrlTest, vec![GroupMember::Node("a".into()), GroupMember::Node("b".into())]),
            group("VlessOnly", Strategy::Select, vec![GroupMember::Node("a".into())]),
        ];

        let err = compile(&[], &groups, &nodes).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnresolvedGroup {
                format: FORMAT,
                group: "VlessOnly".into()
            }
        );

        let artifact = compile(&[], &groups[..1], &nodes).unwrap();
        assert_eq!(artifact.dropped.len(), 1);
        assert!(artifact.content.contains("Mixed = url-test, T, url="));
        assert!(!artifact.content.contains("vless"));
    }

    #[test]
    fn test_regex_matcher_is_unsupported() {
        let rules = vec![rule("re", 1, Matcher::DomainRegex("^ad[0-9]+\\.".into()), Target::Reject)];
        let err = compile(&rules, &[], &[]).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedMatcher { ref rule, .. } if rule == "re"));
    }

    #[test]
    fn test_managed_config_line() {
        let resolution = resolve_parts(&[], &[], &[], &[], &[], 1).unwrap();
        let mut settings = CompilersConfig::default();
        settings.forwarding_proxy.managed_config_url = Some("https://cp.example.com/api/config/forwarding-proxy".into());
        let input = CompileInput {
            resolution: &resolution,
            overlay: None,
            settings: &settings,
        };
        let artifact = FORMAT.compile(&input).unwrap();
        assert!(artifact.content.starts_with(
            "#!MANAGED-CONFIG https://cp.example.com/api/config/forwarding-proxy interval=86400 strict=true\n"
        ));
    }

    #[test]
    fn test_vmess_websocket_directive() {
        let n = node(
            "v",
            "US",
            Protocol::Vmess,
            json!({"uuid": "id-1", "alterId": 0, "tls": true, "servername": "cdn.example.com",
                   "network": "ws", "ws-opts": {"path": "/ray", "headers": {"Host": "cdn.example.com"}}}),
        );
        assert_eq!(
            proxy_directive(&n).unwrap(),
            "vmess, v.example.net, 443, username=id-1, vmess-aead=true, tls=true, sni=cdn.example.com, ws=true, ws-path=/ray, ws-headers=Host:cdn.example.com"
        );

        let grpc = node("g", "G", Protocol::Vmess, json!({"uuid": "id-2", "network": "grpc"}));
        assert!(proxy_directive(&grpc).is_err());
    }
}
