use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::auth;
use crate::admin::error::ApiError;
use crate::admin::AppState;
use crate::compile::{Artifact, TargetFormat};
use crate::fleet::registry::effective_host;
use crate::fleet::{
    AgentState, AgentStatus, Attempt, CommandReport, FormatPush, InstallParams, PushReport, Registered, Registration,
};
use crate::model::{Aggregation, ModelSnapshot, Node, Protocol};
use crate::rules::expand_aggregation;

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_format(raw: &str) -> Result<TargetFormat, ApiError> {
    raw.parse().map_err(ApiError::bad_request)
}

/// Client address. `X-Forwarded-For` is only read when the socket peer is
/// one of `admin.trusted_proxies`.
pub struct PeerAddr(pub Option<IpAddr>);

impl FromRequestParts<AppState> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let connected = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        Ok(PeerAddr(client_ip(
            &parts.headers,
            connected,
            &state.config.admin.trusted_proxies,
        )))
    }
}

/// Walk the forwarded chain from the nearest hop and stop at the first
/// address that is not a trusted proxy.
fn client_ip(headers: &HeaderMap, connected: Option<IpAddr>, trusted: &[IpAddr]) -> Option<IpAddr> {
    let mut client = connected;
    if !client.is_some_and(|ip| trusted.contains(&ip)) {
        return client;
    }
    let hops = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect::<Vec<_>>();
    for hop in hops.into_iter().rev() {
        let Ok(ip) = hop.parse::<IpAddr>() else {
            break;
        };
        client = Some(ip);
        if !trusted.contains(&ip) {
            break;
        }
    }
    client
}

// --- Status ---

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub model_version: u64,
    pub agents: usize,
    pub reachable: usize,
    pub subscriptions_in_flight: usize,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let statuses = state.dispatcher.statuses();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        model_version: state.store.version(),
        agents: statuses.len(),
        reachable: statuses.iter().filter(|s| s.state == AgentState::Reachable).count(),
        subscriptions_in_flight: state.resolver.in_flight(),
    })
}

/// Agent record without its token.
#[derive(Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub formats: Vec<TargetFormat>,
    pub enabled: bool,
    pub disabled: bool,
    pub last_pushed: BTreeMap<TargetFormat, String>,
    pub status: AgentStatus,
}

pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    let snapshot = state.store.snapshot();
    let agents = snapshot
        .agents
        .iter()
        .map(|agent| AgentSummary {
            id: agent.id.clone(),
            name: agent.name.clone(),
            host: agent.host.clone(),
            port: agent.port,
            formats: agent.formats.clone(),
            enabled: agent.enabled,
            disabled: agent.disabled,
            last_pushed: agent.last_pushed.clone(),
            status: state.dispatcher.handle_for(agent).status(),
        })
        .collect();
    Json(agents)
}

pub async fn get_agent_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<AgentStatus> {
    Ok(Json(state.dispatcher.status(&id)?))
}

// --- Push ---

#[derive(Debug, Default, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub formats: Vec<TargetFormat>,
}

pub async fn push_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PushRequest>,
) -> ApiResult<PushReport> {
    Ok(Json(state.dispatcher.push_config(&id, &request.formats).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct FleetPushRequest {
    #[serde(default)]
    pub formats: Vec<TargetFormat>,
    pub deadline_secs: Option<u64>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentPushResult {
    Ok {
        report: PushReport,
    },
    Failed {
        error: String,
        transient: bool,
        formats: Vec<FormatPush>,
        attempts: Vec<Attempt>,
    },
}

#[derive(Serialize)]
pub struct FleetPushResponse {
    pub succeeded: usize,
    pub failed: usize,
    pub agents: BTreeMap<String, AgentPushResult>,
}

pub async fn push_fleet(
    State(state): State<AppState>,
    Json(request): Json<FleetPushRequest>,
) -> ApiResult<FleetPushResponse> {
    let deadline = request.deadline_secs.map(Duration::from_secs);
    let results = state.dispatcher.push_fleet(&request.formats, deadline).await?;

    let mut response = FleetPushResponse {
        succeeded: 0,
        failed: 0,
        agents: BTreeMap::new(),
    };
    for (agent_id, result) in results {
        let entry = match result {
            Ok(report) => {
                response.succeeded += 1;
                AgentPushResult::Ok { report }
            }
            Err(failure) => {
                response.failed += 1;
                AgentPushResult::Failed {
                    transient: failure.is_transient(),
                    error: failure.to_string(),
                    formats: failure.formats,
                    attempts: failure.attempts,
                }
            }
        };
        response.agents.insert(agent_id, entry);
    }
    Ok(Json(response))
}

// --- Commands ---

pub async fn restart_agent(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<CommandReport> {
    Ok(Json(state.dispatcher.restart(&id).await?))
}

pub async fn uninstall_agent(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<CommandReport> {
    Ok(Json(state.dispatcher.uninstall(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct LoggingRequest {
    pub enabled: bool,
}

pub async fn set_agent_logging(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<LoggingRequest>,
) -> ApiResult<CommandReport> {
    Ok(Json(state.dispatcher.set_logging(&id, request.enabled).await?))
}

// --- Logs ---

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub path: String,
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    100
}

#[derive(Serialize)]
pub struct LogsResponse {
    pub agent_id: String,
    pub path: String,
    pub lines: Vec<String>,
}

pub async fn get_agent_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<LogsResponse> {
    let lines = state.dispatcher.fetch_logs(&id, &query.path, query.lines).await?;
    Ok(Json(LogsResponse {
        agent_id: id,
        path: query.path,
        lines,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ClearLogRequest {
    pub path: String,
}

pub async fn clear_agent_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ClearLogRequest>,
) -> ApiResult<CommandReport> {
    Ok(Json(state.dispatcher.clear_log(&id, &request.path).await?))
}

// --- Install and registration ---

#[derive(Debug, Default, Deserialize)]
pub struct InstallQuery {
    pub name: Option<String>,
    pub format: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
    /// `env` renders through the install renderer; anything else is JSON.
    pub output: Option<String>,
}

fn install_response(state: &AppState, mut params: InstallParams, output: Option<&str>) -> Result<Response, ApiError> {
    params.register_token = state.config.admin.registration_token.clone();
    if output != Some("env") {
        return Ok(Json(params).into_response());
    }
    let text = state
        .renderer
        .render(&params)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(([(header::CONTENT_TYPE, state.renderer.content_type())], text).into_response())
}

pub async fn get_agent_install(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<InstallQuery>,
) -> Result<Response, ApiError> {
    let snapshot = state.store.snapshot();
    let agent = snapshot
        .agent(&id)
        .ok_or_else(|| ApiError::not_found(format!("agent '{}' not found", id)))?;
    let params = InstallParams::for_agent(agent, &state.config.admin.public_url);
    install_response(&state, params, query.output.as_deref())
}

pub async fn get_new_install(
    State(state): State<AppState>,
    Query(query): Query<InstallQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref() {
        Some(raw) => parse_format(raw)?,
        None => TargetFormat::RoutingEngine,
    };
    let params = InstallParams::new(
        &state.config.admin.public_url,
        query.name.as_deref().unwrap_or("My Agent"),
        format,
        query.port.unwrap_or(8080),
        query.host.as_deref().unwrap_or(""),
    );
    install_response(&state, params, query.output.as_deref())
}

pub async fn register_agent(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    headers: HeaderMap,
    Json(mut registration): Json<Registration>,
) -> ApiResult<Registered> {
    if !auth::registration_allowed(&state, &headers) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "registration token required"));
    }
    registration.host = effective_host(&registration.host, peer);
    Ok(Json(state.registry.register(registration)?))
}

// --- Artifacts ---

pub async fn get_artifact(State(state): State<AppState>, Path(format): Path<String>) -> ApiResult<Artifact> {
    let format = parse_format(&format)?;
    let artifact = state.generator.generate(format)?;
    Ok(Json(Artifact::clone(&artifact)))
}

#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    pub token: Option<String>,
}

/// Raw artifact for agents that pull their configuration.
pub async fn serve_config(
    State(state): State<AppState>,
    Path(format): Path<String>,
    Query(query): Query<ConfigQuery>,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.admin.config_token.as_deref() else {
        return Err(ApiError::not_found("config endpoint is disabled"));
    };
    if query.token.as_deref() != Some(expected) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid config token"));
    }

    let format = parse_format(&format)?;
    let artifact = state.generator.generate(format)?;
    let headers = [
        (header::CONTENT_TYPE, format.content_type().to_string()),
        (HeaderName::from_static("x-config-hash"), artifact.hash.clone()),
    ];
    Ok((headers, artifact.content.clone()).into_response())
}

#[derive(Serialize)]
pub struct OverlayResponse {
    pub format: TargetFormat,
    pub model_version: u64,
}

pub async fn put_overlay(
    State(state): State<AppState>,
    Path(format): Path<String>,
    body: String,
) -> ApiResult<OverlayResponse> {
    let format = parse_format(&format)?;
    let model_version = state.store.set_overlay(format, &body)?;
    tracing::info!(format = %format, bytes = body.len(), model_version, "Overlay replaced");
    Ok(Json(OverlayResponse { format, model_version }))
}

// --- Model ---

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub redact: bool,
}

/// The whole model as JSON, optionally with secrets masked.
pub async fn export_model(State(state): State<AppState>, Query(query): Query<ExportQuery>) -> Json<ModelSnapshot> {
    let snapshot = state.store.snapshot();
    if query.redact {
        Json(snapshot.redacted())
    } else {
        Json(ModelSnapshot::clone(&snapshot))
    }
}

#[derive(Serialize)]
pub struct ModelWrite {
    pub model_version: u64,
}

/// Replace the whole model with an exported one.
pub async fn import_model(State(state): State<AppState>, Json(snapshot): Json<ModelSnapshot>) -> ApiResult<ModelWrite> {
    if snapshot.is_redacted() {
        return Err(ApiError::bad_request("refusing to import a redacted export"));
    }
    let (nodes, agents) = (snapshot.nodes.len(), snapshot.agents.len());
    let model_version = state.store.replace_all(snapshot)?;
    tracing::info!(nodes, agents, model_version, "Model imported");
    Ok(Json(ModelWrite { model_version }))
}

/// Start over with an empty model.
pub async fn reset_model(State(state): State<AppState>) -> ApiResult<ModelWrite> {
    let model_version = state.store.replace_all(ModelSnapshot::default())?;
    tracing::warn!(model_version, "Model reset");
    Ok(Json(ModelWrite { model_version }))
}

// --- Aggregations ---

pub async fn put_aggregation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut aggregation): Json<Aggregation>,
) -> ApiResult<ModelWrite> {
    aggregation.id = id;
    let model_version = state.store.upsert_aggregation(aggregation)?;
    Ok(Json(ModelWrite { model_version }))
}

pub async fn delete_aggregation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ModelWrite> {
    let model_version = state.store.remove_aggregation(&id)?;
    Ok(Json(ModelWrite { model_version }))
}

#[derive(Serialize)]
pub struct PreviewNode {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
}

#[derive(Serialize)]
pub struct AggregationPreview {
    pub id: String,
    pub enabled: bool,
    pub count: usize,
    pub nodes: Vec<PreviewNode>,
    /// Live nodes per listed subscription, before filtering.
    pub subscription_node_counts: BTreeMap<String, usize>,
}

/// Nodes an aggregation expands to right now.
pub async fn preview_aggregation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<AggregationPreview> {
    let snapshot = state.store.snapshot();
    let aggregation = snapshot
        .aggregation(&id)
        .ok_or_else(|| ApiError::not_found(format!("aggregation '{}' not found", id)))?;

    let nodes: Vec<PreviewNode> = expand_aggregation(aggregation, &snapshot.nodes)?
        .into_iter()
        .map(|n| PreviewNode {
            id: n.id.clone(),
            name: n.name.clone(),
            protocol: n.protocol,
        })
        .collect();
    let subscription_node_counts = aggregation
        .subscriptions
        .iter()
        .map(|sub| {
            let live = snapshot.subscription_nodes(sub).filter(|n| n.enabled).count();
            (sub.clone(), live)
        })
        .collect();

    Ok(Json(AggregationPreview {
        id: aggregation.id.clone(),
        enabled: aggregation.enabled,
        count: nodes.len(),
        nodes,
        subscription_node_counts,
    }))
}

// --- Subscriptions ---

#[derive(Debug, Default, Deserialize)]
pub struct ResolveQuery {
    #[serde(default)]
    pub preview: bool,
}

#[derive(Serialize)]
pub struct ResolveResponse {
    pub subscription_id: String,
    pub preview: bool,
    pub node_count: usize,
    pub nodes: Vec<Node>,
}

pub async fn resolve_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<ResolveResponse> {
    let nodes = state.resolver.resolve(&id, query.preview).await?;
    Ok(Json(ResolveResponse {
        subscription_id: id,
        preview: query.preview,
        node_count: nodes.len(),
        nodes,
    }))
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubscriptionOutcome {
    Ok { node_count: usize },
    Failed { kind: &'static str, error: String },
}

pub async fn resolve_all_subscriptions(State(state): State<AppState>) -> Json<BTreeMap<String, SubscriptionOutcome>> {
    let results = state
        .resolver
        .resolve_all()
        .await
        .into_iter()
        .map(|(id, result)| {
            let outcome = match result {
                Ok(node_count) => SubscriptionOutcome::Ok { node_count },
                Err(e) => SubscriptionOutcome::Failed {
                    kind: e.kind(),
                    error: e.to_string(),
                },
            };
            (id, outcome)
        })
        .collect();
    Json(results)
}
