//! Discovery admin handlers: trigger single/batch rounds, inspect history
//! and statistics, read the current capability graph.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use service_core::error::AppError;
use validator::Validate;

use crate::AppState;
use crate::dtos::discovery::{BatchDiscoverRequest, DiscoverParams};
use crate::models::{CapabilityGraph, DiscoveryRecord, DiscoveryStats, DiscoveryStatus};
use crate::services::{DiscoveryReport, ErrorClass};

/// Trigger discovery for one application
#[utoipa::path(
    post,
    path = "/admin/apps/{client_id}/discover",
    params(
        ("client_id" = String, Path, description = "Application to reconcile"),
        ("force" = Option<bool>, Query, description = "Bypass the cache window")
    ),
    responses(
        (status = 200, description = "Discovery completed", body = DiscoveryReport),
        (status = 400, description = "Configuration or validation failure", body = DiscoveryReport),
        (status = 502, description = "Application unreachable after retries", body = DiscoveryReport)
    ),
    security(("admin_api_key" = [])),
    tag = "Discovery"
)]
pub async fn discover_app(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(params): Query<DiscoverParams>,
) -> (StatusCode, Json<DiscoveryReport>) {
    let report = state.discovery.discover_report(&client_id, params.force).await;
    (report_status(&report), Json(report))
}

/// Trigger discovery for many applications
///
/// Error isolation: each entry carries its own outcome; one failing
/// application never aborts the batch.
#[utoipa::path(
    post,
    path = "/admin/discovery/batch",
    request_body = BatchDiscoverRequest,
    responses(
        (status = 200, description = "Per-application discovery reports", body = [DiscoveryReport])
    ),
    security(("admin_api_key" = [])),
    tag = "Discovery"
)]
pub async fn batch_discover(
    State(state): State<AppState>,
    Json(request): Json<BatchDiscoverRequest>,
) -> Result<Json<Vec<DiscoveryReport>>, AppError> {
    request.validate()?;
    let reports = state
        .discovery
        .batch_discover(&request.client_ids, request.force)
        .await;
    Ok(Json(reports))
}

/// Fetch discovery history for an application
#[utoipa::path(
    get,
    path = "/admin/apps/{client_id}/discovery/history",
    params(("client_id" = String, Path, description = "Application")),
    responses(
        (status = 200, description = "Bounded discovery history", body = [DiscoveryRecord])
    ),
    security(("admin_api_key" = [])),
    tag = "Discovery"
)]
pub async fn discovery_history(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Vec<DiscoveryRecord>>, AppError> {
    let history = state
        .discovery
        .history(&client_id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(history))
}

/// Fetch rolling discovery statistics for an application
#[utoipa::path(
    get,
    path = "/admin/apps/{client_id}/discovery/stats",
    params(("client_id" = String, Path, description = "Application")),
    responses(
        (status = 200, description = "Rolling success rate and latency", body = DiscoveryStats)
    ),
    security(("admin_api_key" = [])),
    tag = "Discovery"
)]
pub async fn discovery_stats(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<DiscoveryStats>, AppError> {
    let stats = state
        .discovery
        .stats(&client_id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(stats))
}

/// Read the current capability graph for an application
#[utoipa::path(
    get,
    path = "/admin/apps/{client_id}/graph",
    params(("client_id" = String, Path, description = "Application")),
    responses(
        (status = 200, description = "Current graph snapshot", body = CapabilityGraph),
        (status = 404, description = "No graph discovered yet")
    ),
    security(("admin_api_key" = [])),
    tag = "Discovery"
)]
pub async fn capability_graph(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<CapabilityGraph>, AppError> {
    state
        .registry
        .snapshot(&client_id)
        .map(|graph| Json(graph.as_ref().clone()))
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("no capability graph for {}", client_id))
        })
}

fn report_status(report: &DiscoveryReport) -> StatusCode {
    match report.status {
        DiscoveryStatus::Success | DiscoveryStatus::Partial => StatusCode::OK,
        DiscoveryStatus::Error => match report.error_class {
            Some(ErrorClass::NetworkError)
            | Some(ErrorClass::TimeoutError)
            | Some(ErrorClass::ServerError) => StatusCode::BAD_GATEWAY,
            Some(ErrorClass::AuthenticationError) => StatusCode::UNAUTHORIZED,
            Some(ErrorClass::ValidationError)
            | Some(ErrorClass::ConfigurationError)
            | None => StatusCode::BAD_REQUEST,
        },
    }
}
