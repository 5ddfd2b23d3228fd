//! Operator HTTP API.
//!
//! A thin axum layer over the core; every handler delegates to the store,
//! the generator, the resolver or the dispatcher.
//!
//! # Routes
//! ```text
//! public:
//!   GET  /health
//!   POST /api/agents/register            registration token or api key
//!   GET  /api/config/{format}?token=     config token
//! api key:
//!   GET  /api/status
//!   GET  /api/agents
//!   GET  /api/agents/{id}/status
//!   POST /api/agents/{id}/push           {"formats": [...]}
//!   POST /api/agents/{id}/restart
//!   POST /api/agents/{id}/uninstall
//!   POST /api/agents/{id}/logging        {"enabled": bool}
//!   GET  /api/agents/{id}/logs?path=&lines=
//!   POST /api/agents/{id}/logs/clear     {"path": ...}
//!   GET  /api/agents/{id}/install?output=env
//!   GET  /api/install?name=&format=&port=&host=&output=env
//!   POST /api/fleet/push                 {"formats": [...], "deadline_secs": n}
//!   GET  /api/artifacts/{format}
//!   PUT  /api/overlays/{format}          raw text body
//!   POST /api/subscriptions/{id}/resolve?preview=
//!   POST /api/subscriptions/resolve
//!   GET  /api/model?redact=
//!   PUT  /api/model                      exported model JSON
//!   POST /api/model/reset
//!   PUT  /api/aggregations/{id}
//!   DELETE /api/aggregations/{id}
//!   GET  /api/aggregations/{id}/preview
//! ```

pub mod auth;
pub mod error;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::compile::Generator;
use crate::config::FleetConfig;
use crate::fleet::{AgentRegistry, Dispatcher, EnvFileRenderer, InstallScriptRenderer};
use crate::lifecycle::{Services, Shutdown};
use crate::model::ModelStore;
use crate::subscription::SubscriptionResolver;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<FleetConfig>,
    pub store: Arc<ModelStore>,
    pub generator: Arc<Generator>,
    pub dispatcher: Arc<Dispatcher>,
    pub resolver: Arc<SubscriptionResolver>,
    pub registry: Arc<AgentRegistry>,
    pub renderer: Arc<dyn InstallScriptRenderer>,
}

impl AppState {
    pub fn new(services: &Services) -> Self {
        Self {
            config: Arc::clone(&services.config),
            store: Arc::clone(&services.store),
            generator: Arc::clone(&services.generator),
            dispatcher: Arc::clone(&services.dispatcher),
            resolver: Arc::clone(&services.resolver),
            registry: Arc::clone(&services.registry),
            renderer: Arc::new(EnvFileRenderer),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn InstallScriptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }
}

/// Build the admin router with all middleware layers.
#[allow(deprecated)]
pub fn setup_admin_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.admin.request_timeout_secs);

    let protected = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}/status", get(get_agent_status))
        .route("/api/agents/{id}/push", post(push_agent))
        .route("/api/agents/{id}/restart", post(restart_agent))
        .route("/api/agents/{id}/uninstall", post(uninstall_agent))
        .route("/api/agents/{id}/logging", post(set_agent_logging))
        .route("/api/agents/{id}/logs", get(get_agent_logs))
        .route("/api/agents/{id}/logs/clear", post(clear_agent_log))
        .route("/api/agents/{id}/install", get(get_agent_install))
        .route("/api/install", get(get_new_install))
        .route("/api/fleet/push", post(push_fleet))
        .route("/api/artifacts/{format}", get(get_artifact))
        .route("/api/overlays/{format}", put(put_overlay))
        .route("/api/subscriptions/{id}/resolve", post(resolve_subscription))
        .route("/api/subscriptions/resolve", post(resolve_all_subscriptions))
        .route("/api/model", get(export_model).put(import_model))
        .route("/api/model/reset", post(reset_model))
        .route("/api/aggregations/{id}", put(put_aggregation).delete(delete_aggregation))
        .route("/api/aggregations/{id}/preview", get(preview_aggregation))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/api/agents/register", post(register_agent))
        .route("/api/config/{format}", get(serve_config))
        .merge(protected)
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: &Shutdown) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    let app = setup_admin_router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.signalled())
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
