//! Routing-engine compiler (Clash/mihomo YAML).
//!
//! # Responsibilities
//! - Emit the header, `proxies`, `proxy-groups` and `rules` sections
//! - Keep route order as the order of the `rules` list
//!
//! # Design Decisions
//! - Every matcher kind and every protocol is representable; nothing is dropped
//! - Proxies are flow mappings with name/type/server/port first, then the
//!   node parameters in key order
//! - IP-based rules carry `no-resolve` so domain traffic is never resolved
//!   just to evaluate them

use crate::compile::{policy_name, yaml_flow_value, yaml_line, yaml_str, CompileError, CompileInput, NodeNames, Rendered};
use crate::config::RoutingEngineConfig;
use crate::model::Node;
use crate::rules::{Matcher, ResolvedGroup, Route};

pub(crate) fn render(input: &CompileInput<'_>) -> Result<Rendered, CompileError> {
    let resolution = input.resolution;
    let cfg = &input.settings.routing_engine;
    let names = NodeNames::build(
        &resolution.nodes,
        resolution.groups.iter().map(|g| g.name.as_str()),
        |n| n.trim().to_string(),
    );

    let mut out = String::new();
    header(&mut out, cfg);

    if resolution.nodes.is_empty() {
        out.push_str("proxies: []\n");
    } else {
        out.push_str("proxies:\n");
        for node in &resolution.nodes {
            let name = names.get(&node.id).unwrap_or(node.name.as_str());
            out.push_str(&format!("  - {}\n", proxy_entry(node, name)));
        }
    }

    if resolution.groups.is_empty() {
        out.push_str("proxy-groups: []\n");
    } else {
        out.push_str("proxy-groups:\n");
        for group in &resolution.groups {
            group_entry(&mut out, group, &names, cfg);
        }
    }

    out.push_str("rules:\n");
    for route in resolution.table.routes() {
        out.push_str(&format!("  - {}\n", yaml_line(&rule_line(route))));
    }

    Ok(Rendered {
        content: out,
        dropped: Vec::new(),
    })
}

fn header(out: &mut String, cfg: &RoutingEngineConfig) {
    out.push_str(&format!("mixed-port: {}\n", cfg.mixed_port));
    out.push_str(&format!("allow-lan: {}\n", cfg.allow_lan));
    out.push_str(&format!("bind-address: {}\n", yaml_str(&cfg.bind_address)));
    out.push_str(&format!("mode: {}\n", yaml_str(&cfg.mode)));
    out.push_str(&format!("log-level: {}\n", yaml_str(&cfg.log_level)));
    out.push_str(&format!("external-controller: {}\n", yaml_str(&cfg.external_controller)));

    let dns = &cfg.dns;
    out.push_str("dns:\n");
    out.push_str(&format!("  enable: {}\n", dns.enable));
    out.push_str(&format!("  listen: {}\n", yaml_str(&dns.listen)));
    out.push_str(&format!("  enhanced-mode: {}\n", yaml_str(&dns.enhanced_mode)));
    out.push_str(&format!("  fake-ip-range: {}\n", yaml_str(&dns.fake_ip_range)));
    for (key, servers) in [("nameserver", &dns.nameserver), ("fallback", &dns.fallback)] {
        if servers.is_empty() {
            continue;
        }
        out.push_str(&format!("  {}:\n", key));
        for server in servers {
            out.push_str(&format!("    - {}\n", yaml_str(server)));
        }
    }
}

fn proxy_entry(node: &Node, name: &str) -> String {
    let mut fields = vec![
        format!("name: {}", yaml_str(name)),
        format!("type: {}", node.protocol.as_str()),
        format!("server: {}", yaml_str(&node.server)),
        format!("port: {}", node.port),
    ];
    for (key, value) in &node.params {
        if matches!(key.as_str(), "name" | "type" | "server" | "port") || value.is_null() {
            continue;
        }
        fields.push(format!("{}: {}", yaml_str(key), yaml_flow_value(value)));
    }
    format!("{{{}}}", fields.join(", "))
}

fn group_entry(out: &mut String, group: &ResolvedGroup, names: &NodeNames, cfg: &RoutingEngineConfig) {
    out.push_str(&format!("  - name: {}\n", yaml_str(&group.name)));
    out.push_str(&format!("    type: {}\n", group.strategy.as_str()));
    out.push_str("    proxies:\n");
    for member in group.members.iter().filter_map(|m| names.member(m)) {
        out.push_str(&format!("      - {}\n", yaml_str(member)));
    }
    if group.strategy.is_probing() {
        let url = group.test_url.as_deref().unwrap_or(&cfg.test_url);
        let interval = group.interval_secs.unwrap_or(cfg.test_interval_secs);
        out.push_str(&format!("    url: {}\n", yaml_str(url)));
        out.push_str(&format!("    interval: {}\n", interval));
    }
}

fn rule_line(route: &Route) -> String {
    let policy = policy_name(&route.target);
    match &route.matcher {
        Matcher::Final => format!("MATCH,{}", policy),
        m if m.is_ip_based() => format!("{},{},{},no-resolve", m.type_name(), m.value(), policy),
        m => format!("{},{},{}", m.type_name(), m.value(), policy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::TargetFormat;
    use crate::config::CompilersConfig;
    use crate::model::{GroupMember, NodeSource, Protocol, ProxyGroup, Rule, RuleKind, Strategy, Target};
    use crate::rules::resolve_parts;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn fixture() -> (Vec<Rule>, Vec<ProxyGroup>, Vec<Node>) {
        let mut params = BTreeMap::new();
        params.insert("cipher".to_string(), json!("aes-256-gcm"));
        params.insert("password".to_string(), json!("pw"));
        let node = Node {
            id: "n1".into(),
            name: "HK 01".into(),
            protocol: Protocol::Shadowsocks,
            server: "hk.example.net".into(),
            port: 8388,
            params,
            source: NodeSource::Manual,
            pinned: false,
            enabled: true,
            tags: vec![],
        };
        let groups = vec![ProxyGroup {
            name: "Auto".into(),
            strategy: Strategy::UrlTest,
            members: vec![GroupMember::Node("n1".into())],
            test_url: None,
            interval_secs: Some(600),
            enabled: true,
        }];
        let rule = |id: &str, pos, m, t| Rule {
            id: String::from(id),
            position: pos,
            kind: RuleKind::Matcher { matcher: m },
            target: t,
            enabled: true,
        };
        let rules = vec![
            rule("r1", 1, Matcher::Domain("ads.example.com".into()), Target::Reject),
            rule("r2", 2, Matcher::GeoIp("CN".into()), Target::Direct),
            rule("r3", 3, Matcher::DomainSuffix("example.com".into()), Target::Group("Auto".into())),
        ];
        (rules, groups, vec![node])
    }

    #[test]
    fn test_renders_sections_in_order() {
        let (rules, groups, nodes) = fixture();
        let resolution = resolve_parts(&rules, &[], &groups, &nodes, &[], 3).unwrap();
        let settings = CompilersConfig::default();
        let input = CompileInput {
            resolution: &resolution,
            overlay: None,
            settings: &settings,
        };
        let artifact = TargetFormat::RoutingEngine.compile(&input).unwrap();
        let text = &artifact.content;

        assert!(text.starts_with("mixed-port: 7890\n"));
        assert!(text.contains(
            "  - {name: \"HK 01\", type: ss, server: hk.example.net, port: 8388, cipher: aes-256-gcm, password: pw}\n"
        ));
        assert!(text.contains("  - name: Auto\n    type: url-test\n    proxies:\n      - \"HK 01\"\n"));
        assert!(text.contains("    interval: 600\n"));

        let rules_at = text.find("rules:\n").unwrap();
        assert_eq!(
            &text[rules_at..],
            "rules:\n  - DOMAIN,ads.example.com,REJECT\n  - GEOIP,CN,DIRECT,no-resolve\n  - DOMAIN-SUFFIX,example.com,Auto\n  - MATCH,DIRECT\n"
        );
        assert_eq!(artifact.snapshot_version, 3);
        assert!(artifact.dropped.is_empty());
    }
}
