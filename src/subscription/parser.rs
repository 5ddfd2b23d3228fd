//! Subscription content parsing.
//!
//! # Responsibilities
//! - Detect the body format (clash document, base64 link list, plain link list)
//! - Turn every recognizable entry into a [`ParsedNode`]
//!
//! # Design Decisions
//! - Unparseable individual entries are skipped and logged; only a body with
//!   no recognizable structure at all is an error
//! - Clash documents go through a real YAML loader; entries are converted to
//!   JSON values so nested options (`ws-opts.headers`) survive intact
//! - Parameters are stored under the routing-engine vocabulary
//!   (`cipher`, `servername`, `ws-opts`, ...) so that format renders them as-is
//!   and the other formats translate from one canonical naming

use std::collections::BTreeMap;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::model::Protocol;
use crate::subscription::SubscriptionError;

/// A node as read from a subscription, before identity and naming are
/// assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNode {
    pub name: String,
    pub protocol: Protocol,
    pub server: String,
    pub port: u16,
    pub params: BTreeMap<String, Value>,
}

/// Parse a raw subscription body.
pub fn parse_subscription(body: &[u8]) -> Result<Vec<ParsedNode>, SubscriptionError> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim_start_matches('\u{feff}');

    if is_clash_document(text) {
        return parse_clash(text);
    }
    if let Some(decoded) = decode_base64_body(text) {
        if is_clash_document(&decoded) {
            return parse_clash(&decoded);
        }
        if looks_like_link_list(&decoded) {
            return Ok(parse_link_list(&decoded));
        }
    }
    if looks_like_link_list(text) {
        return Ok(parse_link_list(text));
    }
    Err(SubscriptionError::Parse(
        "content is neither a clash document nor a proxy link list".into(),
    ))
}

fn is_clash_document(text: &str) -> bool {
    text.lines().any(|l| l.trim_end() == "proxies:" || l.starts_with("proxies: "))
}

fn looks_like_link_list(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .any(|l| l.contains("://") || l.starts_with('{'))
}

/// Whole-body base64 (standard or URL-safe, padded or not).
fn decode_base64_body(text: &str) -> Option<String> {
    if text.contains("://") {
        return None;
    }
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    decode_b64(&compact).and_then(|bytes| String::from_utf8(bytes).ok())
}

pub(crate) fn decode_b64(input: &str) -> Option<Vec<u8>> {
    let trimmed = input.trim().trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .ok()
}

fn decode_b64_text(input: &str) -> Result<String, String> {
    let bytes = decode_b64(input).ok_or_else(|| "invalid base64".to_string())?;
    String::from_utf8(bytes).map_err(|_| "base64 payload is not UTF-8".to_string())
}

/// Percent-decode a URI component. `+` is kept literally.
fn decode_component(raw: &str) -> String {
    let escaped = raw.replace('+', "%2B");
    url::form_urlencoded::parse(format!("v={}", escaped).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| raw.to_string())
}

// --- link lists ---

fn parse_link_list(text: &str) -> Vec<ParsedNode> {
    let mut nodes = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_link(line) {
            Ok(node) => nodes.push(node),
            Err(reason) => {
                tracing::debug!(reason = %reason, line = %truncate(line, 64), "Skipping subscription entry");
            }
        }
    }
    nodes
}

/// Parse one link or one inline object line.
pub fn parse_link(line: &str) -> Result<ParsedNode, String> {
    if line.starts_with('{') {
        let value: Value = serde_yaml::from_str(line).map_err(|e| format!("inline object: {}", e))?;
        return node_from_object(value);
    }
    let (scheme, rest) = line
        .split_once("://")
        .ok_or_else(|| "not a proxy link".to_string())?;
    match scheme.to_ascii_lowercase().as_str() {
        "ss" => parse_ss(rest),
        "ssr" => parse_ssr(rest),
        "vmess" => parse_vmess(rest),
        "vless" => parse_url_link(line, Protocol::Vless),
        "trojan" => parse_url_link(line, Protocol::Trojan),
        "hysteria" => parse_url_link(line, Protocol::Hysteria),
        "hysteria2" | "hy2" => parse_url_link(line, Protocol::Hysteria2),
        other => Err(format!("unsupported scheme '{}'", other)),
    }
}

fn split_fragment(rest: &str) -> (&str, Option<String>) {
    match rest.split_once('#') {
        Some((body, frag)) => (body, Some(decode_component(frag)).filter(|n| !n.is_empty())),
        None => (rest, None),
    }
}

fn split_host_port(host_port: &str) -> Result<(String, u16), String> {
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in '{}'", host_port))?;
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|_| format!("invalid port '{}'", port))?;
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || port == 0 {
        return Err("empty server or zero port".into());
    }
    Ok((host.to_string(), port))
}

fn default_name(protocol: Protocol, server: &str, port: u16) -> String {
    format!("{} {}:{}", protocol, server, port)
}

/// `ss://` in SIP002 (`userinfo@host:port`) or legacy fully encoded form.
fn parse_ss(rest: &str) -> Result<ParsedNode, String> {
    let (body, name) = split_fragment(rest);
    let (userinfo, host_part) = match body.rsplit_once('@') {
        Some((user, host)) => {
            let decoded = decode_b64_text(user).unwrap_or_else(|_| decode_component(user));
            (decoded, host.to_string())
        }
        None => {
            let decoded = decode_b64_text(body)?;
            let (user, host) = decoded
                .rsplit_once('@')
                .ok_or_else(|| "legacy ss payload lacks '@'".to_string())?;
            (user.to_string(), host.to_string())
        }
    };

    let (host_port, query) = match host_part.split_once('?') {
        Some((hp, q)) => (hp.trim_end_matches('/').to_string(), Some(q.to_string())),
        None => (host_part.trim_end_matches('/').to_string(), None),
    };
    let (cipher, password) = userinfo
        .split_once(':')
        .ok_or_else(|| "ss userinfo must be method:password".to_string())?;
    let (server, port) = split_host_port(&host_port)?;

    let mut params = BTreeMap::new();
    params.insert("cipher".into(), json!(cipher));
    params.insert("password".into(), json!(password));
    if let Some(q) = query {
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            if k == "plugin" {
                params.insert("plugin".into(), json!(v.into_owned()));
            }
        }
    }

    Ok(ParsedNode {
        name: name.unwrap_or_else(|| default_name(Protocol::Shadowsocks, &server, port)),
        protocol: Protocol::Shadowsocks,
        server,
        port,
        params,
    })
}

/// `ssr://base64(server:port:protocol:method:obfs:base64pass/?params)`.
fn parse_ssr(rest: &str) -> Result<ParsedNode, String> {
    let decoded = decode_b64_text(rest)?;
    let (main, query) = match decoded.split_once("/?") {
        Some((m, q)) => (m, q),
        None => (decoded.trim_end_matches('/'), ""),
    };

    // Split from the right so IPv6 servers survive.
    let mut parts = main.rsplitn(6, ':');
    let password_b64 = parts.next().unwrap_or_default();
    let obfs = parts.next().unwrap_or_default();
    let cipher = parts.next().unwrap_or_default();
    let protocol = parts.next().unwrap_or_default();
    let port = parts.next().unwrap_or_default();
    let server = parts.next().ok_or_else(|| "ssr payload has too few fields".to_string())?;
    let (server, port) = split_host_port(&format!("{}:{}", server, port))?;

    let mut extra = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        if let Some((k, v)) = pair.split_once('=') {
            extra.insert(k.to_string(), decode_b64_text(v).unwrap_or_default());
        }
    }

    let mut params = BTreeMap::new();
    params.insert("cipher".into(), json!(cipher));
    params.insert("password".into(), json!(decode_b64_text(password_b64)?));
    params.insert("protocol".into(), json!(protocol));
    params.insert("obfs".into(), json!(obfs));
    params.insert(
        "protocol-param".into(),
        json!(extra.get("protoparam").cloned().unwrap_or_default()),
    );
    params.insert(
        "obfs-param".into(),
        json!(extra.get("obfsparam").cloned().unwrap_or_default()),
    );

    let name = extra
        .get("remarks")
        .filter(|r| !r.is_empty())
        .cloned()
        .unwrap_or_else(|| default_name(Protocol::ShadowsocksR, &server, port));
    Ok(ParsedNode {
        name,
        protocol: Protocol::ShadowsocksR,
        server,
        port,
        params,
    })
}

/// `vmess://base64(json)`.
fn parse_vmess(rest: &str) -> Result<ParsedNode, String> {
    let decoded = decode_b64_text(rest)?;
    let data: Value = serde_json::from_str(&decoded).map_err(|e| format!("vmess json: {}", e))?;
    let field = |key: &str| -> String {
        match data.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    };

    let server = field("add");
    let port: u16 = field("port")
        .parse()
        .map_err(|_| format!("invalid vmess port '{}'", field("port")))?;
    if server.is_empty() || port == 0 {
        return Err("vmess entry lacks server or port".into());
    }

    let network = Some(field("net")).filter(|n| !n.is_empty()).unwrap_or_else(|| "tcp".into());
    let mut params = BTreeMap::new();
    params.insert("uuid".into(), json!(field("id")));
    params.insert("alterId".into(), json!(field("aid").parse::<u32>().unwrap_or(0)));
    params.insert(
        "cipher".into(),
        json!(Some(field("scy")).filter(|s| !s.is_empty()).unwrap_or_else(|| "auto".into())),
    );
    params.insert("tls".into(), json!(field("tls") == "tls"));
    if !field("sni").is_empty() {
        params.insert("servername".into(), json!(field("sni")));
    }
    if network == "ws" {
        let path = Some(field("path")).filter(|p| !p.is_empty()).unwrap_or_else(|| "/".into());
        params.insert(
            "ws-opts".into(),
            json!({ "path": path, "headers": { "Host": field("host") } }),
        );
    }
    params.insert("network".into(), json!(network));

    let name = Some(field("ps"))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_name(Protocol::Vmess, &server, port));
    Ok(ParsedNode {
        name,
        protocol: Protocol::Vmess,
        server,
        port,
        params,
    })
}

/// URL-shaped links: vless, trojan, hysteria, hysteria2.
fn parse_url_link(line: &str, protocol: Protocol) -> Result<ParsedNode, String> {
    let url = Url::parse(line).map_err(|e| format!("invalid link: {}", e))?;
    let server = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| "link has no host".to_string())?;
    let port = url.port().ok_or_else(|| "link has no port".to_string())?;
    let user = decode_component(url.username());
    let user = match url.password() {
        Some(pass) => format!("{}:{}", user, decode_component(pass)),
        None => user,
    };
    let query: BTreeMap<String, String> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let q = |key: &str| query.get(key).map(String::as_str).filter(|v| !v.is_empty());
    let truthy = |key: &str| matches!(q(key), Some("1") | Some("true"));

    let mut params = BTreeMap::new();
    match protocol {
        Protocol::Vless => {
            params.insert("uuid".into(), json!(user));
            let security = q("security").unwrap_or("none");
            params.insert("tls".into(), json!(security == "tls" || security == "reality"));
            if let Some(flow) = q("flow") {
                params.insert("flow".into(), json!(flow));
            }
            if security == "reality" {
                params.insert(
                    "reality-opts".into(),
                    json!({ "public-key": q("pbk").unwrap_or_default(), "short-id": q("sid").unwrap_or_default() }),
                );
            }
            if let Some(fp) = q("fp") {
                params.insert("client-fingerprint".into(), json!(fp));
            }
        }
        Protocol::Trojan => {
            params.insert("password".into(), json!(user));
            params.insert(
                "skip-cert-verify".into(),
                json!(truthy("allowInsecure") || truthy("insecure")),
            );
        }
        Protocol::Hysteria => {
            let auth = q("auth").map(str::to_string).unwrap_or(user);
            params.insert("auth-str".into(), json!(auth));
            for key in ["protocol", "up", "down", "obfs"] {
                if let Some(v) = q(key) {
                    params.insert(key.into(), json!(v));
                }
            }
            params.insert("skip-cert-verify".into(), json!(truthy("insecure")));
        }
        _ => {
            params.insert("password".into(), json!(user));
            if let Some(obfs) = q("obfs") {
                params.insert("obfs".into(), json!(obfs));
            }
            if let Some(obfs_password) = q("obfs-password") {
                params.insert("obfs-password".into(), json!(obfs_password));
            }
            params.insert("skip-cert-verify".into(), json!(truthy("insecure")));
        }
    }

    if let Some(sni) = q("sni").or_else(|| q("peer")) {
        let key = if protocol == Protocol::Vless { "servername" } else { "sni" };
        params.insert(key.into(), json!(sni));
    }
    if let Some(alpn) = q("alpn") {
        params.insert("alpn".into(), json!(alpn.split(',').collect::<Vec<_>>()));
    }
    if matches!(protocol, Protocol::Vless | Protocol::Trojan) {
        let network = q("type").unwrap_or("tcp");
        match network {
            "ws" => {
                params.insert(
                    "ws-opts".into(),
                    json!({ "path": q("path").unwrap_or("/"), "headers": { "Host": q("host").unwrap_or_default() } }),
                );
            }
            "grpc" => {
                params.insert(
                    "grpc-opts".into(),
                    json!({ "grpc-service-name": q("serviceName").unwrap_or_default() }),
                );
            }
            _ => {}
        }
        if network != "tcp" || protocol == Protocol::Vless {
            params.insert("network".into(), json!(network));
        }
    }

    let name = url
        .fragment()
        .map(decode_component)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_name(protocol, &server, port));
    Ok(ParsedNode {
        name,
        protocol,
        server,
        port,
        params,
    })
}

// --- clash documents ---

#[derive(Deserialize)]
struct ClashDocument {
    #[serde(default)]
    proxies: Option<Vec<serde_yaml::Value>>,
}

/// Entries of the top-level `proxies:` list.
fn parse_clash(text: &str) -> Result<Vec<ParsedNode>, SubscriptionError> {
    let document: ClashDocument =
        serde_yaml::from_str(text).map_err(|e| SubscriptionError::Parse(format!("invalid clash document: {}", e)))?;

    Ok(document
        .proxies
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            let parsed = serde_json::to_value(&entry)
                .map_err(|e| e.to_string())
                .and_then(node_from_object);
            match parsed {
                Ok(node) => Some(node),
                Err(reason) => {
                    tracing::debug!(reason = %reason, "Skipping proxy entry");
                    None
                }
            }
        })
        .collect())
}

/// Build a node from a `{name, type, server, port, ...}` object.
fn node_from_object(value: Value) -> Result<ParsedNode, String> {
    let Value::Object(mut map) = value else {
        return Err("entry is not an object".into());
    };
    let text = |v: Option<Value>| match v {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    let protocol: Protocol = text(map.remove("type")).parse()?;
    let server = text(map.remove("server"));
    let port: u16 = text(map.remove("port"))
        .parse()
        .map_err(|_| "missing or invalid port".to_string())?;
    if server.is_empty() || port == 0 {
        return Err("entry lacks server or port".into());
    }
    let name = Some(text(map.remove("name")))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_name(protocol, &server, port));

    Ok(ParsedNode {
        name,
        protocol,
        server,
        port,
        params: map.into_iter().collect(),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn test_clash_flow_entries() {
        let body = "port: 7890\nproxies:\n  - {name: HK 01, type: ss, server: hk.example.net, port: 8388, cipher: aes-128-gcm, password: \"p@ss, word\"}\n  - {name: JP, type: trojan, server: jp.example.net, port: 443, password: x, alpn: [h2, http/1.1]}\nproxy-groups:\n  - {name: Proxy, type: select, proxies: [HK 01]}\n";
        let nodes = parse_subscription(body.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "HK 01");
        assert_eq!(nodes[0].params["password"], json!("p@ss, word"));
        assert_eq!(nodes[1].protocol, Protocol::Trojan);
        assert_eq!(nodes[1].params["alpn"], json!(["h2", "http/1.1"]));
    }

    #[test]
    fn test_clash_block_entries() {
        let body = "proxies:\n  - name: \"US 1\"\n    type: vmess\n    server: us.example.net\n    port: 443\n    uuid: 0000\n    ws-opts:\n      path: /ray\n  - name: SG\n    type: ss\n    server: sg.example.net\n    port: 8388\n    cipher: aes-256-gcm\n    password: secret # inline comment\nrules:\n  - MATCH,DIRECT\n";
        let nodes = parse_subscription(body.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "US 1");
        assert_eq!(nodes[0].params["ws-opts"], json!({"path": "/ray"}));
        assert_eq!(nodes[1].params["password"], json!("secret"));
    }

    #[test]
    fn test_clash_nested_options_survive() {
        let body = "mixed-port: 7890\nproxies:\n  - name: WS\n    type: vmess\n    server: v.example.net\n    port: 443\n    uuid: b831381d-6324-4d53-ad4f-8cda48b30811\n    alterId: 0\n    cipher: auto\n    tls: true\n    network: ws\n    ws-opts:\n      path: /ray\n      headers:\n        Host: cdn.example.net\n  - name: Broken\n    type: vmess\n    server: b.example.net\n";
        let nodes = parse_subscription(body.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 1);
        let ws = &nodes[0].params["ws-opts"];
        assert_eq!(ws["path"], json!("/ray"));
        assert_eq!(ws["headers"]["Host"], json!("cdn.example.net"));
        assert_eq!(nodes[0].params["tls"], json!(true));
    }

    #[test]
    fn test_invalid_clash_document() {
        let err = parse_subscription(b"proxies:\n  - name: [unclosed\n").unwrap_err();
        assert!(matches!(err, SubscriptionError::Parse(_)));
    }

    #[test]
    fn test_base64_link_list() {
        let links = "trojan://pw@a.example.net:443?sni=a.example.net#A%20node\nss://YWVzLTI1Ni1nY206c2VjcmV0@b.example.net:8388#B\n";
        let body = STANDARD.encode(links);
        let nodes = parse_subscription(body.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "A node");
        assert_eq!(nodes[0].params["sni"], json!("a.example.net"));
        assert_eq!(nodes[1].params["cipher"], json!("aes-256-gcm"));
        assert_eq!(nodes[1].params["password"], json!("secret"));
    }

    #[test]
    fn test_legacy_ss_and_vmess() {
        let legacy = format!("ss://{}#Old", STANDARD.encode("rc4-md5:pw@10.0.0.1:443"));
        let node = parse_link(&legacy).unwrap();
        assert_eq!(node.server, "10.0.0.1");
        assert_eq!(node.name, "Old");

        let vmess_json = r#"{"v":"2","ps":"VM","add":"v.example.net","port":"443","id":"uuid-1","aid":"0","net":"ws","path":"/w","host":"cdn.example.net","tls":"tls"}"#;
        let node = parse_link(&format!("vmess://{}", STANDARD.encode(vmess_json))).unwrap();
        assert_eq!(node.port, 443);
        assert_eq!(node.params["tls"], json!(true));
        assert_eq!(node.params["ws-opts"]["headers"]["Host"], json!("cdn.example.net"));
    }

    #[test]
    fn test_vless_reality_and_hysteria2() {
        let vless = "vless://id-1@r.example.net:443?security=reality&pbk=KEY&sid=ab&sni=www.example.com&type=grpc&serviceName=svc&flow=xtls-rprx-vision#R";
        let node = parse_link(vless).unwrap();
        assert_eq!(node.params["reality-opts"]["public-key"], json!("KEY"));
        assert_eq!(node.params["servername"], json!("www.example.com"));
        assert_eq!(node.params["grpc-opts"]["grpc-service-name"], json!("svc"));

        let hy2 = parse_link("hy2://auth@h.example.net:8443?insecure=1&obfs=salamander&obfs-password=x#H").unwrap();
        assert_eq!(hy2.protocol, Protocol::Hysteria2);
        assert_eq!(hy2.params["skip-cert-verify"], json!(true));
    }

    #[test]
    fn test_ssr_link() {
        let payload = format!(
            "s.example.net:8989:auth_aes128_md5:aes-256-cfb:tls1.2_ticket_auth:{}/?remarks={}",
            URL_SAFE_NO_PAD.encode("pw"),
            URL_SAFE_NO_PAD.encode("SSR Node")
        );
        let node = parse_link(&format!("ssr://{}", URL_SAFE_NO_PAD.encode(payload))).unwrap();
        assert_eq!(node.name, "SSR Node");
        assert_eq!(node.port, 8989);
        assert_eq!(node.params["protocol"], json!("auth_aes128_md5"));
    }

    #[test]
    fn test_json_line_and_bad_lines_skipped() {
        let body = "{\"name\":\"J\",\"type\":\"http\",\"server\":\"p.example.net\",\"port\":3128}\nnot a link\nwireguard://x@y:1\n";
        let nodes = parse_subscription(body.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].protocol, Protocol::Http);
    }

    #[test]
    fn test_unrecognized_body() {
        let err = parse_subscription(b"<html>Forbidden</html>").unwrap_err();
        assert!(matches!(err, SubscriptionError::Parse(_)));
    }
}
