//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the control
//! plane. All types derive Serde traits for deserialization from config files.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    /// Operator HTTP API.
    pub admin: AdminConfig,

    /// Model store persistence.
    pub store: StoreConfig,

    /// Subscription fetching.
    pub subscriptions: SubscriptionConfig,

    /// Agent push/command timeouts.
    pub dispatcher: DispatcherConfig,

    /// Background agent probing.
    pub heartbeat: HeartbeatConfig,

    /// Retry policy for transient agent failures.
    pub retries: RetryConfig,

    /// Per-format header defaults.
    pub compilers: CompilersConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bind address (e.g., "127.0.0.1:8090").
    pub bind_address: String,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Token guarding `GET /api/config/{format}`; unset disables the route.
    pub config_token: Option<String>,

    /// Token agents present to `POST /api/agents/register`; the api key is
    /// always accepted as well.
    pub registration_token: Option<String>,

    /// Externally reachable base URL, handed to agents at install time.
    pub public_url: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Reverse proxies whose `X-Forwarded-For` header is believed. Empty
    /// means the socket peer is always the client.
    pub trusted_proxies: Vec<IpAddr>,
}

/// Shipped api key; validation refuses to run with it.
pub const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8090".to_string(),
            api_key: PLACEHOLDER_API_KEY.to_string(),
            config_token: None,
            registration_token: None,
            public_url: "http://127.0.0.1:8090".to_string(),
            request_timeout_secs: 150,
            trusted_proxies: Vec::new(),
        }
    }
}

/// Model store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding the model.
    pub path: String,

    /// Reload the model when the file changes on disk.
    pub watch: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "data/model.json".to_string(),
            watch: true,
        }
    }
}

/// Subscription fetch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Fetch timeout in seconds.
    pub fetch_timeout_secs: u64,

    /// User agent sent to subscription providers.
    pub user_agent: String,

    /// Largest accepted body.
    pub max_body_bytes: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            user_agent: "clash.meta".to_string(),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Acknowledgment timeout of one artifact transfer, in seconds.
    pub push_timeout_secs: u64,

    /// Timeout of restart/uninstall/logging/log commands, in seconds.
    pub command_timeout_secs: u64,

    /// Default overall deadline of a fleet-wide push, in seconds.
    pub fleet_deadline_secs: u64,

    /// Upper bound for `max_lines` of a log fetch.
    pub max_log_lines: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            push_timeout_secs: 30,
            command_timeout_secs: 15,
            fleet_deadline_secs: 120,
            max_log_lines: 5000,
        }
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Enable background probing.
    pub enabled: bool,

    /// Probe interval in seconds.
    pub interval_secs: u64,

    /// Probe timeout in seconds.
    pub probe_timeout_secs: u64,

    /// Consecutive missed probes before an agent is unreachable.
    pub unreachable_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            probe_timeout_secs: 5,
            unreachable_threshold: 3,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
        }
    }
}

/// Compiler settings, one block per format.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CompilersConfig {
    pub routing_engine: RoutingEngineConfig,
    pub forwarding_proxy: ForwardingProxyConfig,
    pub dns_router: DnsRouterConfig,
}

/// Header of the routing-engine YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingEngineConfig {
    pub mixed_port: u16,
    pub allow_lan: bool,
    pub bind_address: String,
    pub mode: String,
    pub log_level: String,
    pub external_controller: String,
    pub dns: RoutingEngineDnsConfig,

    /// Probe URL for url-test/fallback/load-balance groups without one.
    pub test_url: String,

    /// Probe interval for those groups, in seconds.
    pub test_interval_secs: u32,
}

impl Default for RoutingEngineConfig {
    fn default() -> Self {
        Self {
            mixed_port: 7890,
            allow_lan: true,
            bind_address: "*".to_string(),
            mode: "rule".to_string(),
            log_level: "info".to_string(),
            external_controller: "127.0.0.1:9090".to_string(),
            dns: RoutingEngineDnsConfig::default(),
            test_url: default_test_url(),
            test_interval_secs: 300,
        }
    }
}

/// `dns:` block of the routing-engine YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingEngineDnsConfig {
    pub enable: bool,
    pub listen: String,
    pub enhanced_mode: String,
    pub fake_ip_range: String,
    pub nameserver: Vec<String>,
    pub fallback: Vec<String>,
}

impl Default for RoutingEngineDnsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            listen: "0.0.0.0:53".to_string(),
            enhanced_mode: "fake-ip".to_string(),
            fake_ip_range: "198.18.0.1/16".to_string(),
            nameserver: vec!["223.5.5.5".to_string(), "119.29.29.29".to_string()],
            fallback: vec![
                "https://1.1.1.1/dns-query".to_string(),
                "https://dns.google/dns-query".to_string(),
            ],
        }
    }
}

/// Header of the forwarding-proxy INI.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingProxyConfig {
    /// URL emitted in the `#!MANAGED-CONFIG` line; none omits the line.
    pub managed_config_url: Option<String>,

    /// Update interval advertised in the managed-config line, in seconds.
    pub managed_interval_secs: u64,

    /// `key = value` lines of the `[General]` section.
    pub general: Vec<String>,

    pub test_url: String,
    pub test_interval_secs: u32,
}

impl Default for ForwardingProxyConfig {
    fn default() -> Self {
        Self {
            managed_config_url: None,
            managed_interval_secs: 86400,
            general: vec![
                "loglevel = notify".to_string(),
                format!("internet-test-url = {}", default_test_url()),
                format!("proxy-test-url = {}", default_test_url()),
                "test-timeout = 3".to_string(),
                "skip-proxy = localhost, *.local, captive.apple.com, 10.0.0.0/8, 100.64.0.0/10, 127.0.0.0/8, 169.254.0.0/16, 172.16.0.0/12, 192.168.0.0/16, 198.18.0.0/15, 224.0.0.0/4".to_string(),
                "dns-server = 223.5.5.5, 119.29.29.29, system".to_string(),
                "ipv6 = true".to_string(),
                "http-listen = 0.0.0.0:6152".to_string(),
                "socks5-listen = 0.0.0.0:6153".to_string(),
                "exclude-simple-hostnames = true".to_string(),
            ],
            test_url: default_test_url(),
            test_interval_secs: 300,
        }
    }
}

/// Settings of the DNS-router YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsRouterConfig {
    pub log_level: String,

    /// UDP/TCP listen address of the DNS server.
    pub listen: String,

    /// Upstreams used for `direct` decisions.
    pub local_upstreams: Vec<String>,

    /// Upstreams used for proxied decisions.
    pub remote_upstreams: Vec<String>,

    /// Directory holding per-country IP lists (`<cc>.txt`).
    pub geoip_dir: String,

    /// Response cache entries; 0 disables the cache.
    pub cache_size: u32,
}

impl Default for DnsRouterConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listen: "0.0.0.0:53".to_string(),
            local_upstreams: vec!["223.5.5.5".to_string(), "119.29.29.29".to_string()],
            remote_upstreams: vec![
                "https://1.1.1.1/dns-query".to_string(),
                "https://dns.google/dns-query".to_string(),
            ],
            geoip_dir: "/etc/mosdns/geoip".to_string(),
            cache_size: 4096,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`.
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9100".to_string(),
        }
    }
}

fn default_test_url() -> String {
    "http://www.gstatic.com/generate_204".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: FleetConfig = toml::from_str("[admin]\napi_key = \"k\"\n").unwrap();
        assert_eq!(config.admin.api_key, "k");
        assert_eq!(config.heartbeat.unreachable_threshold, 3);
        assert_eq!(config.retries.max_attempts, 3);
        assert_eq!(config.compilers.routing_engine.mixed_port, 7890);
    }

    #[test]
    fn test_nested_compiler_section() {
        let text = r#"
[compilers.dns_router]
local_upstreams = ["10.0.0.1"]

[compilers.forwarding_proxy]
managed_config_url = "https://cp.example.com/api/config/forwarding-proxy?token=t"
"#;
        let config: FleetConfig = toml::from_str(text).unwrap();
        assert_eq!(config.compilers.dns_router.local_upstreams, vec!["10.0.0.1"]);
        assert_eq!(config.compilers.dns_router.cache_size, 4096);
        assert!(config.compilers.forwarding_proxy.managed_config_url.is_some());
    }
}
