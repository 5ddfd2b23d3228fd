//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every subsystem in dependency order from a validated config
//! - Start the background tasks (model watcher, heartbeat)
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Transport and subscription source are injected so tests can assemble
//!   the same graph against in-memory fakes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::RecommendedWatcher;
use tokio::task::JoinHandle;

use crate::compile::Generator;
use crate::config::watcher::ModelWatcher;
use crate::config::FleetConfig;
use crate::error::Result;
use crate::fleet::{
    AgentRegistry, AgentTransport, Dispatcher, HeartbeatMonitor, HttpAgentTransport, RetryPolicy, TransportTimeouts,
};
use crate::lifecycle::Shutdown;
use crate::model::ModelStore;
use crate::subscription::{HttpSubscriptionSource, SubscriptionResolver, SubscriptionSource};

/// The assembled control plane.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<FleetConfig>,
    pub store: Arc<ModelStore>,
    pub generator: Arc<Generator>,
    pub dispatcher: Arc<Dispatcher>,
    pub resolver: Arc<SubscriptionResolver>,
    pub registry: Arc<AgentRegistry>,
}

impl Services {
    /// Wire the subsystems around an existing store.
    pub fn assemble(
        config: FleetConfig,
        store: Arc<ModelStore>,
        transport: Arc<dyn AgentTransport>,
        source: Arc<dyn SubscriptionSource>,
    ) -> Self {
        let generator = Arc::new(Generator::new(Arc::clone(&store), config.compilers.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&generator),
            transport,
            RetryPolicy::from(&config.retries),
            config.dispatcher.clone(),
        ));
        let resolver = Arc::new(SubscriptionResolver::new(Arc::clone(&store), source));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store)));

        Self {
            config: Arc::new(config),
            store,
            generator,
            dispatcher,
            resolver,
            registry,
        }
    }

    /// Open the persisted model and build the HTTP-backed subsystems.
    pub fn from_config(config: FleetConfig) -> Result<Self> {
        let store = Arc::new(ModelStore::open(&config.store.path)?);

        let timeouts = TransportTimeouts {
            push: Duration::from_secs(config.dispatcher.push_timeout_secs),
            command: Duration::from_secs(config.dispatcher.command_timeout_secs),
            probe: Duration::from_secs(config.heartbeat.probe_timeout_secs),
        };
        let transport = Arc::new(HttpAgentTransport::new(timeouts)?);
        let source = Arc::new(HttpSubscriptionSource::new(&config.subscriptions)?);

        Ok(Self::assemble(config, store, transport, source))
    }

    /// Watch the model file for external edits.
    ///
    /// Returns the watcher, which must be kept alive, or `None` when watching
    /// is disabled.
    pub fn watch_model(&self, shutdown: &Shutdown) -> Result<Option<RecommendedWatcher>> {
        if !self.config.store.watch {
            return Ok(None);
        }
        let Some(path) = self.store.path().map(PathBuf::from) else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Model file does not exist yet, not watching it");
            return Ok(None);
        }

        let (watcher, mut updates) = ModelWatcher::new(&path, Arc::clone(&self.store));
        let handle = watcher.run()?;

        let generator = Arc::clone(&self.generator);
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    version = updates.recv() => match version {
                        Some(version) => {
                            generator.invalidate();
                            tracing::info!(version, "Artifacts invalidated after model reload");
                        }
                        None => break,
                    },
                    _ = stop.recv() => break,
                }
            }
        });
        Ok(Some(handle))
    }

    /// Start the heartbeat loop.
    pub fn spawn_heartbeat(&self, shutdown: &Shutdown) -> JoinHandle<()> {
        let monitor = HeartbeatMonitor::new(Arc::clone(&self.dispatcher), self.config.heartbeat.clone());
        let rx = shutdown.subscribe();
        tokio::spawn(monitor.run(rx))
    }
}
