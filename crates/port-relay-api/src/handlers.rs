//! API route handlers.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use port_relay_core::{
    local_ipv4_addresses, AggregatedStats, ConnectionInfo, Error, LocalAddress, Registry, Rule,
    RuleFailure, RuleStore, RuleUpdate, SessionInfo, Template,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub store: Arc<RuleStore>,
    pub log_file: Option<PathBuf>,
}

/// API response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Core error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidEndpoint(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyRunning(_) | Error::NotRunning(_) => StatusCode::CONFLICT,
            Error::BindFailed { .. } | Error::AddressResolution(_) | Error::CloseFailed(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        warn!("API request failed: {}", self.0);

        (
            status,
            Json(ErrorResponse {
                success: false,
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Stats response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub aggregated: AggregatedStats,
    pub sessions: Vec<SessionInfo>,
    pub active_connections: Vec<ConnectionInfo>,
}

/// Rule tuple for starting a relay.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    #[serde(default)]
    pub listen_addr: String,
    pub listen_port: String,
    pub target_addr: String,
    pub target_port: String,
}

/// Listen endpoint of a relay.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenRequest {
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub listen_port: String,
}

#[derive(Debug, Serialize)]
pub struct RunningResponse {
    pub running: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: usize,
}

#[derive(Debug, Deserialize)]
pub struct TemplateRequest {
    pub name: String,
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    #[serde(default)]
    pub old_name: String,
    #[serde(default)]
    pub new_name: String,
}

#[derive(Debug, Serialize)]
pub struct TemplateRunResponse {
    pub failures: Vec<RuleFailure>,
}

/// History query parameters.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Health check endpoint.
pub async fn health() -> Json<ApiResponse<HealthResponse>> {
    ApiResponse::ok(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Interface addresses a relay can listen on.
pub async fn get_local_ips() -> ApiResult<Vec<LocalAddress>> {
    Ok(ApiResponse::ok(local_ipv4_addresses()?))
}

// ==================== Relays ====================

pub async fn start_tcp(
    State(state): State<AppState>,
    Json(req): Json<ForwardRequest>,
) -> ApiResult<SessionInfo> {
    let session = state
        .registry
        .start_stream(&req.listen_addr, &req.listen_port, &req.target_addr, &req.target_port)
        .await?;
    Ok(ApiResponse::ok(session))
}

pub async fn stop_tcp(
    State(state): State<AppState>,
    Json(req): Json<ListenRequest>,
) -> ApiResult<RunningResponse> {
    state
        .registry
        .stop_stream(&req.listen_addr, &req.listen_port)
        .await?;
    Ok(ApiResponse::ok(RunningResponse { running: false }))
}

pub async fn tcp_running(
    State(state): State<AppState>,
    Query(query): Query<ListenRequest>,
) -> Json<ApiResponse<RunningResponse>> {
    let running = state
        .registry
        .is_stream_running(&query.listen_addr, &query.listen_port)
        .await;
    ApiResponse::ok(RunningResponse { running })
}

pub async fn start_udp(
    State(state): State<AppState>,
    Json(req): Json<ForwardRequest>,
) -> ApiResult<SessionInfo> {
    let session = state
        .registry
        .start_datagram(&req.listen_addr, &req.listen_port, &req.target_addr, &req.target_port)
        .await?;
    Ok(ApiResponse::ok(session))
}

pub async fn stop_udp(
    State(state): State<AppState>,
    Json(req): Json<ListenRequest>,
) -> ApiResult<RunningResponse> {
    state
        .registry
        .stop_datagram(&req.listen_addr, &req.listen_port)
        .await?;
    Ok(ApiResponse::ok(RunningResponse { running: false }))
}

pub async fn udp_running(
    State(state): State<AppState>,
    Query(query): Query<ListenRequest>,
) -> Json<ApiResponse<RunningResponse>> {
    let running = state
        .registry
        .is_datagram_running(&query.listen_addr, &query.listen_port)
        .await;
    ApiResponse::ok(RunningResponse { running })
}

/// Active relay sessions.
pub async fn get_sessions(State(state): State<AppState>) -> Json<ApiResponse<Vec<SessionInfo>>> {
    ApiResponse::ok(state.registry.sessions().await)
}

// ==================== Statistics ====================

/// Get relay statistics.
pub async fn get_stats(State(state): State<AppState>) -> Json<ApiResponse<StatsResponse>> {
    let stats = state.registry.stats();

    ApiResponse::ok(StatsResponse {
        aggregated: stats.get_aggregated().await,
        sessions: state.registry.sessions().await,
        active_connections: stats.get_active().await,
    })
}

/// Get active connections.
pub async fn get_connections(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ConnectionInfo>>> {
    ApiResponse::ok(state.registry.stats().get_active().await)
}

/// Get connection history.
pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<ApiResponse<Vec<ConnectionInfo>>> {
    ApiResponse::ok(state.registry.stats().get_history(query.limit).await)
}

// ==================== Rules ====================

pub async fn list_rules(State(state): State<AppState>) -> Json<ApiResponse<Vec<Rule>>> {
    ApiResponse::ok(state.store.rules().await)
}

pub async fn add_rule(State(state): State<AppState>) -> ApiResult<Rule> {
    Ok(ApiResponse::ok(state.store.add_rule().await?))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Json(update): Json<RuleUpdate>,
) -> ApiResult<Rule> {
    Ok(ApiResponse::ok(state.store.update_rule(update).await?))
}

pub async fn delete_rules(
    State(state): State<AppState>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<DeletedResponse> {
    let deleted = state.store.delete_rules(&req.ids).await?;
    Ok(ApiResponse::ok(DeletedResponse { deleted }))
}

// ==================== Templates ====================

pub async fn list_templates(State(state): State<AppState>) -> Json<ApiResponse<Vec<Template>>> {
    ApiResponse::ok(state.store.templates().await)
}

pub async fn save_template(
    State(state): State<AppState>,
    Json(req): Json<TemplateRequest>,
) -> ApiResult<Template> {
    Ok(ApiResponse::ok(
        state.store.save_as_template(&req.name, &req.ids).await?,
    ))
}

/// Resolve a template to its rules without touching the rule list.
pub async fn apply_template(
    State(state): State<AppState>,
    Json(req): Json<NameRequest>,
) -> ApiResult<Vec<Rule>> {
    Ok(ApiResponse::ok(state.store.template_rules(&req.name).await?))
}

pub async fn rename_template(
    State(state): State<AppState>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<()> {
    state
        .store
        .rename_template(&req.old_name, &req.new_name)
        .await?;
    Ok(ApiResponse::ok(()))
}

pub async fn delete_template(
    State(state): State<AppState>,
    Json(req): Json<NameRequest>,
) -> ApiResult<DeletedResponse> {
    let removed = state.store.delete_template(&req.name).await?;
    Ok(ApiResponse::ok(DeletedResponse {
        deleted: removed as usize,
    }))
}

/// Start the TCP and UDP relays of every rule in a template.
pub async fn start_template(
    State(state): State<AppState>,
    Json(req): Json<NameRequest>,
) -> ApiResult<TemplateRunResponse> {
    let rules = state.store.template_rules(&req.name).await?;
    let failures = state.registry.start_rules(&rules).await;
    Ok(ApiResponse::ok(TemplateRunResponse { failures }))
}

/// Stop the TCP and UDP relays of every rule in a template.
pub async fn stop_template(
    State(state): State<AppState>,
    Json(req): Json<NameRequest>,
) -> ApiResult<TemplateRunResponse> {
    let rules = state.store.template_rules(&req.name).await?;
    let failures = state.registry.stop_rules(&rules).await;
    Ok(ApiResponse::ok(TemplateRunResponse { failures }))
}

// ==================== Log ====================

/// Contents of the log file, if one is configured.
pub async fn get_log(State(state): State<AppState>) -> Result<Response, ApiError> {
    let path = state
        .log_file
        .as_ref()
        .ok_or_else(|| Error::NotFound("log file".into()))?;

    let content = tokio::fs::read_to_string(path).await.map_err(Error::Io)?;

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], content).into_response())
}
