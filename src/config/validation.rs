//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds >= 1)
//! - Validate addresses and URLs before any listener or client is built
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: FleetConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{FleetConfig, PLACEHOLDER_API_KEY};

/// One violated constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

struct Checker {
    errors: Vec<ValidationError>,
}

impl Checker {
    fn check(&mut self, ok: bool, field: &str, message: impl Into<String>) {
        if !ok {
            self.errors.push(ValidationError {
                field: field.to_string(),
                message: message.into(),
            });
        }
    }

    fn socket_addr(&mut self, value: &str, field: &str) {
        self.check(
            value.parse::<SocketAddr>().is_ok(),
            field,
            format!("'{}' is not a socket address", value),
        );
    }

    fn url(&mut self, value: &str, field: &str) {
        self.check(Url::parse(value).is_ok(), field, format!("'{}' is not a URL", value));
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate a parsed configuration.
pub fn validate_config(config: &FleetConfig) -> Result<(), Vec<ValidationError>> {
    let mut c = Checker { errors: Vec::new() };

    let admin = &config.admin;
    c.socket_addr(&admin.bind_address, "admin.bind_address");
    c.check(!admin.api_key.trim().is_empty(), "admin.api_key", "must not be empty");
    c.check(
        admin.api_key != PLACEHOLDER_API_KEY,
        "admin.api_key",
        "still the shipped placeholder; set a real key",
    );
    c.url(&admin.public_url, "admin.public_url");
    if let Some(token) = &admin.config_token {
        c.check(!token.trim().is_empty(), "admin.config_token", "must not be empty when set");
    }
    if let Some(token) = &admin.registration_token {
        c.check(!token.trim().is_empty(), "admin.registration_token", "must not be empty when set");
    }
    c.check(admin.request_timeout_secs > 0, "admin.request_timeout_secs", "must be > 0");

    c.check(!config.store.path.trim().is_empty(), "store.path", "must not be empty");

    let subs = &config.subscriptions;
    c.check(subs.fetch_timeout_secs > 0, "subscriptions.fetch_timeout_secs", "must be > 0");
    c.check(!subs.user_agent.trim().is_empty(), "subscriptions.user_agent", "must not be empty");
    c.check(subs.max_body_bytes > 0, "subscriptions.max_body_bytes", "must be > 0");

    let dispatcher = &config.dispatcher;
    c.check(dispatcher.push_timeout_secs > 0, "dispatcher.push_timeout_secs", "must be > 0");
    c.check(dispatcher.command_timeout_secs > 0, "dispatcher.command_timeout_secs", "must be > 0");
    c.check(
        dispatcher.fleet_deadline_secs >= dispatcher.push_timeout_secs,
        "dispatcher.fleet_deadline_secs",
        "must be at least push_timeout_secs",
    );
    c.check(
        (1..=5000).contains(&dispatcher.max_log_lines),
        "dispatcher.max_log_lines",
        "must be within 1..=5000",
    );

    let heartbeat = &config.heartbeat;
    c.check(heartbeat.interval_secs > 0, "heartbeat.interval_secs", "must be > 0");
    c.check(heartbeat.probe_timeout_secs > 0, "heartbeat.probe_timeout_secs", "must be > 0");
    if heartbeat.interval_secs > 0 {
        c.check(
            heartbeat.probe_timeout_secs <= heartbeat.interval_secs,
            "heartbeat.probe_timeout_secs",
            "must not exceed interval_secs",
        );
    }
    c.check(
        heartbeat.unreachable_threshold >= 1,
        "heartbeat.unreachable_threshold",
        "must be >= 1",
    );

    let retries = &config.retries;
    c.check(retries.max_attempts >= 1, "retries.max_attempts", "must be >= 1");
    c.check(
        retries.base_delay_ms <= retries.max_delay_ms,
        "retries.base_delay_ms",
        "must not exceed max_delay_ms",
    );

    let compilers = &config.compilers;
    c.check(
        compilers.routing_engine.mixed_port > 0,
        "compilers.routing_engine.mixed_port",
        "must be > 0",
    );
    c.url(&compilers.routing_engine.test_url, "compilers.routing_engine.test_url");
    c.url(&compilers.forwarding_proxy.test_url, "compilers.forwarding_proxy.test_url");
    if let Some(url) = &compilers.forwarding_proxy.managed_config_url {
        c.url(url, "compilers.forwarding_proxy.managed_config_url");
    }
    c.check(
        !compilers.dns_router.local_upstreams.is_empty(),
        "compilers.dns_router.local_upstreams",
        "must list at least one upstream",
    );
    c.check(
        !compilers.dns_router.remote_upstreams.is_empty(),
        "compilers.dns_router.remote_upstreams",
        "must list at least one upstream",
    );

    let obs = &config.observability;
    c.check(
        LOG_LEVELS.contains(&obs.log_level.to_ascii_lowercase().as_str()),
        "observability.log_level",
        format!("'{}' is not one of {}", obs.log_level, LOG_LEVELS.join(", ")),
    );
    if obs.metrics_enabled {
        c.socket_addr(&obs.metrics_address, "observability.metrics_address");
    }

    if c.errors.is_empty() {
        Ok(())
    } else {
        Err(c.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> FleetConfig {
        let mut config = FleetConfig::default();
        config.admin.api_key = "s3cret".into();
        config
    }

    #[test]
    fn test_defaults_are_valid_once_keyed() {
        assert_eq!(validate_config(&configured()), Ok(()));
    }

    #[test]
    fn test_placeholder_api_key_is_rejected() {
        let errors = validate_config(&FleetConfig::default()).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "admin.api_key");
        assert!(errors[0].message.contains("placeholder"));
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = configured();
        config.admin.bind_address = "nowhere".into();
        config.dispatcher.max_log_lines = 0;
        config.compilers.dns_router.remote_upstreams.clear();
        config.observability.log_level = "loud".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "admin.bind_address",
                "dispatcher.max_log_lines",
                "compilers.dns_router.remote_upstreams",
                "observability.log_level",
            ]
        );
    }

    #[test]
    fn test_metrics_address_only_checked_when_enabled() {
        let mut config = configured();
        config.observability.metrics_address = "bad".into();
        assert!(validate_config(&config).is_ok());
        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
