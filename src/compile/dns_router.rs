//! DNS-router compiler (mosdns v5 YAML).
//!
//! # Responsibilities
//! - Emit the log block and the plugin list (cache, forwarders, ip sets,
//!   per-decision sequences, servers)
//! - Translate the routing table into one `main_sequence` whose steps keep
//!   table order
//!
//! # Design Decisions
//! - Domain kinds become `qname` matches; `geoip` becomes a `resp_ip` match
//!   against a per-country ip set after a local lookup
//! - Address and port matchers have no meaning before resolution; they are
//!   dropped and reported in the artifact
//! - `final` becomes the default forward: direct goes local, any group goes
//!   remote

use crate::compile::{yaml_line, yaml_str, CompileError, CompileInput, Rendered};
use crate::config::DnsRouterConfig;
use crate::model::Target;
use crate::rules::{Matcher, Route};

const LOCAL_SEQUENCE: &str = "local_sequence";
const REMOTE_SEQUENCE: &str = "remote_sequence";

/// One step of `main_sequence`.
enum Step {
    /// Unconditional plugin call.
    Exec(String),
    /// Conditional action.
    Match { condition: String, action: String },
}

pub(crate) fn render(input: &CompileInput<'_>) -> Result<Rendered, CompileError> {
    let cfg = &input.settings.dns_router;
    let mut dropped = Vec::new();
    let mut countries: Vec<String> = Vec::new();
    let mut steps = Vec::new();

    if cfg.cache_size > 0 {
        steps.push(Step::Exec("$cache".to_string()));
    }

    let mut local_answer = false;
    for route in input.resolution.table.routes() {
        match &route.matcher {
            Matcher::Domain(d) => steps.push(qname(format!("full:{}", d), route)),
            Matcher::DomainSuffix(d) => steps.push(qname(format!("domain:{}", d), route)),
            Matcher::DomainKeyword(d) => steps.push(qname(format!("keyword:{}", d), route)),
            Matcher::DomainRegex(d) => steps.push(qname(format!("regexp:{}", d), route)),
            Matcher::GeoIp(country) => {
                let tag = geoip_tag(country);
                if !countries.contains(country) {
                    countries.push(country.clone());
                }
                if !local_answer {
                    steps.push(Step::Exec("$forward_local".to_string()));
                    local_answer = true;
                }
                let action = match &route.target {
                    Target::Direct => "accept".to_string(),
                    other => action(other),
                };
                steps.push(Step::Match {
                    condition: format!("resp_ip ${}", tag),
                    action,
                });
                continue;
            }
            Matcher::Final => steps.push(Step::Exec(action(&route.target))),
            Matcher::IpCidr(_) | Matcher::DstPort(_) => {
                tracing::debug!(
                    rule = %route.origin.rule_id,
                    matcher = %route.matcher,
                    "Dropping matcher without DNS meaning"
                );
                dropped.push(format!(
                    "rule '{}': {} has no DNS-router representation",
                    route.origin.rule_id, route.matcher
                ));
            }
        }
        local_answer = false;
    }

    let mut out = String::new();
    out.push_str("log:\n");
    out.push_str(&format!("  level: {}\n", yaml_str(&cfg.log_level)));
    out.push_str("plugins:\n");

    if cfg.cache_size > 0 {
        out.push_str(&format!(
            "  - tag: cache\n    type: cache\n    args:\n      size: {}\n",
            cfg.cache_size
        ));
    }
    forward_plugin(&mut out, "forward_local", &cfg.local_upstreams);
    forward_plugin(&mut out, "forward_remote", &cfg.remote_upstreams);

    for country in &countries {
        out.push_str(&format!(
            "  - tag: {}\n    type: ip_set\n    args:\n      files:\n        - {}\n",
            geoip_tag(country),
            yaml_str(&geoip_file(cfg, country))
        ));
    }

    for (tag, forward) in [(LOCAL_SEQUENCE, "$forward_local"), (REMOTE_SEQUENCE, "$forward_remote")] {
        out.push_str(&format!(
            "  - tag: {}\n    type: sequence\n    args:\n      - exec: {}\n      - exec: accept\n",
            tag, forward
        ));
    }

    out.push_str("  - tag: main_sequence\n    type: sequence\n    args:\n");
    for step in &steps {
        match step {
            Step::Exec(exec) => out.push_str(&format!("      - exec: {}\n", yaml_line(exec))),
            Step::Match { condition, action } => {
                out.push_str(&format!("      - matches: {}\n", yaml_line(condition)));
                out.push_str(&format!("        exec: {}\n", yaml_line(action)));
            }
        }
    }

    for server in ["udp_server", "tcp_server"] {
        out.push_str(&format!(
            "  - tag: {}\n    type: {}\n    args:\n      entry: main_sequence\n      listen: {}\n",
            server,
            server,
            yaml_str(&cfg.listen)
        ));
    }

    Ok(Rendered { content: out, dropped })
}

fn qname(pattern: String, route: &Route) -> Step {
    Step::Match {
        condition: format!("qname {}", pattern),
        action: action(&route.target),
    }
}

fn action(target: &Target) -> String {
    match target {
        Target::Direct => format!("goto {}", LOCAL_SEQUENCE),
        Target::Reject => "reject 3".to_string(),
        Target::Group(_) => format!("goto {}", REMOTE_SEQUENCE),
    }
}

fn geoip_tag(country: &str) -> String {
    format!("geoip_{}", country.to_ascii_lowercase())
}

fn geoip_file(cfg: &DnsRouterConfig, country: &str) -> String {
    format!(
        "{}/{}.txt",
        cfg.geoip_dir.trim_end_matches('/'),
        country.to_ascii_lowercase()
    )
}

fn forward_plugin(out: &mut String, tag: &str, upstreams: &[String]) {
    out.push_str(&format!(
        "  - tag: {}\n    type: forward\n    args:\n      concurrent: {}\n      upstreams:\n",
        tag,
        upstreams.len().clamp(1, 3)
    ));
    for addr in upstreams {
        out.push_str(&format!("        - addr: {}\n", yaml_str(addr)));
    }
}
