//! HTTP API consumed by the dashboard.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;

use crate::error::{AdapterError, SyncError, ValidationError};
use crate::query_log::QueryLog;
use crate::runtime::{RemoteHost, Target};
use crate::store::sanitize_label;
use crate::sync::SyncController;
use crate::types::{ContainerOverride, ContainerRecord, ContainerStats, LogLine, QueryLogEntry};

const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 10_000;
const DEFAULT_DNS_LOG_COUNT: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SyncController>,
    pub query_log: Arc<QueryLog>,
}

/// Errors surfaced to HTTP clients as `{error, detail}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Sync(e.into())
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) | Self::Sync(SyncError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            Self::Sync(SyncError::Adapter(AdapterError::NotFound(_))) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            Self::Sync(SyncError::InProgress) => (StatusCode::CONFLICT, "reload_in_progress"),
            Self::Sync(SyncError::Disconnected(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "remote_disconnected")
            }
            Self::Sync(SyncError::Adapter(_)) => (StatusCode::BAD_GATEWAY, "engine_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        let body = Json(json!({ "error": code, "detail": self.to_string() }));
        if status == StatusCode::CONFLICT {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct TargetParams {
    remote_host: Option<String>,
}

impl TargetParams {
    fn target(&self) -> Result<Target, ValidationError> {
        Target::from_param(self.remote_host.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    lines: Option<usize>,
    remote_host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DnsLogsParams {
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct DomainsUpdate {
    #[serde(default)]
    containers: Vec<ContainerOverride>,
    remote_host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteScanRequest {
    #[serde(default)]
    remote_host: String,
}

#[derive(Debug, Deserialize)]
struct ManualLogRequest {
    ip_address: String,
    domain: String,
}

#[derive(Debug, Serialize)]
struct DomainEntry {
    /// Fully qualified name the container is served under.
    name: String,
    enabled: bool,
    address: String,
    published: bool,
}

#[derive(Debug, Serialize)]
struct DomainsResponse {
    domains: BTreeMap<String, DomainEntry>,
    domain_suffix: String,
    remote_host: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/containers", get(list_containers))
        .route("/api/containers/:id/dns", post(toggle_dns))
        .route("/api/containers/:id/stats", get(container_stats))
        .route("/api/containers/:id/logs", get(container_logs))
        .route("/api/domains", get(get_domains).post(update_domains))
        .route("/api/reload", post(force_reload))
        .route(
            "/api/remote-scan",
            post(remote_scan).get(remote_status).delete(remote_disconnect),
        )
        .route("/api/dns/logs", get(dns_logs).post(add_dns_log))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `app` on `bind` until the task is aborted.
pub async fn serve(bind: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("HTTP API listening on {}", bind);
    axum::serve(listener, app).await.map_err(|e| {
        error!("HTTP server error: {}", e);
        e.into()
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "message": "zerodeploy is running" }))
}

async fn list_containers(
    State(state): State<AppState>,
    Query(params): Query<TargetParams>,
) -> ApiResult<Vec<ContainerRecord>> {
    let target = params.target()?;
    Ok(Json(state.controller.list(&target).await?))
}

async fn toggle_dns(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> Json<serde_json::Value> {
    state.controller.store().toggle(&id, req.enabled);
    Json(json!({ "success": true, "id": id, "enabled": req.enabled }))
}

async fn get_domains(
    State(state): State<AppState>,
    Query(params): Query<TargetParams>,
) -> ApiResult<DomainsResponse> {
    let target = params.target()?;
    let containers = state.controller.list(&target).await?;
    let store = state.controller.store();
    let published = store.get();

    let domains = containers
        .into_iter()
        .map(|c| {
            let fqdn = format!("{}.{}", sanitize_label(&c.name), store.suffix());
            let is_published = published
                .get(&fqdn)
                .is_some_and(|r| r.container_id == c.id);
            let entry = DomainEntry {
                name: fqdn,
                enabled: c.dns_enabled,
                address: c.ip_address.map(|ip| ip.to_string()).unwrap_or_default(),
                published: is_published,
            };
            (c.name, entry)
        })
        .collect();

    Ok(Json(DomainsResponse {
        domains,
        domain_suffix: store.suffix().to_string(),
        remote_host: target.remote().map(RemoteHost::to_string),
    }))
}

async fn update_domains(
    State(state): State<AppState>,
    Json(req): Json<DomainsUpdate>,
) -> ApiResult<serde_json::Value> {
    let target = Target::from_param(req.remote_host.as_deref())?;
    let report = state.controller.try_reload(&target, &req.containers).await?;
    info!(
        "DNS configuration for {} updated: {} records (serial {})",
        target, report.published, report.serial
    );
    Ok(Json(json!({
        "success": true,
        "message": "DNS configuration updated",
        "published": report.published,
        "serial": report.serial,
        "remote_host": req.remote_host,
    })))
}

async fn force_reload(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let session = state.controller.session();
    let target = match session.target() {
        Some(target) => target,
        None => {
            let status = session.status();
            return Err(SyncError::Disconnected(status.remote_host.unwrap_or_default()).into());
        }
    };
    let report = state.controller.try_reload(&target, &[]).await?;
    Ok(Json(json!({
        "success": true,
        "message": "DNS service reloaded",
        "published": report.published,
        "serial": report.serial,
    })))
}

async fn remote_scan(
    State(state): State<AppState>,
    Json(req): Json<RemoteScanRequest>,
) -> ApiResult<serde_json::Value> {
    let endpoint = RemoteHost::parse(&req.remote_host)?;
    let containers = state.controller.connect_remote(endpoint.clone()).await?;
    Ok(Json(json!({
        "success": true,
        "containers": containers,
        "remote_host": endpoint.to_string(),
    })))
}

async fn remote_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.session().status())
}

async fn remote_disconnect(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.controller.session().disconnect();
    Json(json!({ "success": true }))
}

async fn container_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TargetParams>,
) -> ApiResult<ContainerStats> {
    let target = params.target()?;
    Ok(Json(state.controller.stats(&target, &id).await?))
}

async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> ApiResult<Vec<LogLine>> {
    let target = Target::from_param(params.remote_host.as_deref())?;
    let lines = params
        .lines
        .unwrap_or(DEFAULT_LOG_LINES)
        .clamp(1, MAX_LOG_LINES);
    Ok(Json(state.controller.logs(&target, &id, lines).await?))
}

async fn dns_logs(
    State(state): State<AppState>,
    Query(params): Query<DnsLogsParams>,
) -> Json<Vec<QueryLogEntry>> {
    let count = params.count.unwrap_or(DEFAULT_DNS_LOG_COUNT);
    Json(state.query_log.recent(count))
}

async fn add_dns_log(
    State(state): State<AppState>,
    Json(req): Json<ManualLogRequest>,
) -> ApiResult<QueryLogEntry> {
    let ip = req.ip_address.trim();
    let domain = req.domain.trim();
    if ip.is_empty() || domain.is_empty() {
        return Err(ApiError::BadRequest(
            "ip_address and domain are required".to_string(),
        ));
    }
    Ok(Json(state.query_log.add_manual(ip, domain)))
}
