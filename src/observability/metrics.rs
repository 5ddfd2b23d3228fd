//! Metrics collection and exposition.
//!
//! # Metrics
//! - `fleet_subscription_resolve_total` (counter): resolutions by outcome
//! - `fleet_generation_total` (counter): artifact generations by format, outcome
//! - `fleet_generation_duration_seconds` (histogram): compile latency by format
//! - `fleet_push_total` (counter): artifact pushes by format, outcome
//! - `fleet_command_total` (counter): agent commands by command, outcome
//! - `fleet_agents_reachable` (gauge): agents whose last heartbeat succeeded
//! - `fleet_retry_attempts_total` (counter): retried agent operations by operation

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(%addr, "Prometheus metrics exporter started"),
        Err(e) => tracing::error!(%addr, error = %e, "Failed to start metrics exporter"),
    }
}

/// Record a subscription resolution; `outcome` is `success` or an error kind.
pub fn record_subscription_resolve(outcome: &'static str) {
    counter!("fleet_subscription_resolve_total", "outcome" => outcome).increment(1);
}

/// Record an artifact generation. `elapsed` is absent for cache hits.
pub fn record_generation(format: &'static str, outcome: &'static str, elapsed: Option<Duration>) {
    counter!("fleet_generation_total", "format" => format, "outcome" => outcome).increment(1);
    if let Some(elapsed) = elapsed {
        histogram!("fleet_generation_duration_seconds", "format" => format).record(elapsed.as_secs_f64());
    }
}

/// Record one per-format push outcome (`pushed`, `skipped`, `failed`).
pub fn record_push(format: &'static str, outcome: &'static str) {
    counter!("fleet_push_total", "format" => format, "outcome" => outcome).increment(1);
}

/// Record a lifecycle or log command.
pub fn record_command(command: &'static str, success: bool) {
    let outcome = if success { "success" } else { "error" };
    counter!("fleet_command_total", "command" => command, "outcome" => outcome).increment(1);
}

/// Record a retry of an agent operation.
pub fn record_retry(operation: &'static str) {
    counter!("fleet_retry_attempts_total", "operation" => operation).increment(1);
}

/// Number of agents currently reachable.
pub fn record_agents_reachable(count: usize) {
    gauge!("fleet_agents_reachable").set(count as f64);
}
