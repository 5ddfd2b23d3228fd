//! Background heartbeat.
//!
//! # Responsibilities
//! - Periodically probe every active agent
//! - Update agent state from the probe results
//!
//! Status reads never trigger a probe; they see whatever the last tick left.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HeartbeatConfig;
use crate::fleet::agent::AgentState;
use crate::fleet::dispatcher::Dispatcher;
use crate::model::Agent;
use crate::observability::metrics;

pub struct HeartbeatMonitor {
    dispatcher: Arc<Dispatcher>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>, config: HeartbeatConfig) -> Self {
        Self { dispatcher, config }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Agent heartbeat disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            threshold = self.config.unreachable_threshold,
            "Heartbeat monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Heartbeat monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every active agent once, concurrently.
    pub async fn check_all(&self) {
        let snapshot = self.dispatcher.store().snapshot();
        let agents: Vec<&Agent> = snapshot.agents.iter().filter(|a| a.enabled && !a.disabled).collect();
        join_all(agents.into_iter().map(|agent| self.check(agent))).await;
        self.dispatcher.prune_handles();

        let reachable = self
            .dispatcher
            .statuses()
            .iter()
            .filter(|s| s.state == AgentState::Reachable)
            .count();
        metrics::record_agents_reachable(reachable);
    }

    async fn check(&self, agent: &Agent) {
        let handle = self.dispatcher.handle_for(agent);
        if handle.is_disabled() {
            return;
        }
        let before = handle.state();
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);

        match time::timeout(timeout, self.dispatcher.transport().probe(agent)).await {
            Ok(Ok(probe)) => {
                if probe.version.is_some() && probe.version != agent.version {
                    if let Err(e) = self.dispatcher.store().set_agent_version(&agent.id, probe.version.clone()) {
                        tracing::warn!(agent_id = %agent.id, error = %e, "Failed to record agent version");
                    }
                }
                handle.mark_alive(probe.version);
            }
            Ok(Err(e)) => {
                tracing::debug!(agent_id = %agent.id, error = %e, "Heartbeat failed");
                handle.mark_missed(self.config.unreachable_threshold, &e.to_string());
            }
            Err(_) => {
                tracing::debug!(agent_id = %agent.id, "Heartbeat timed out");
                handle.mark_missed(self.config.unreachable_threshold, "heartbeat timed out");
            }
        }

        let after = handle.state();
        if before != after {
            tracing::info!(agent_id = %agent.id, from = ?before, to = ?after, "Agent state changed");
        }
    }
}
