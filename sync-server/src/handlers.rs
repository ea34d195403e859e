//! HTTP request handlers for the sync-trigger API.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiError, Result};
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncConnectionRequest {
    pub connection_id: i32
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexRepoRequest {
    pub repo_id: i32
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RebuildPermissionsRequest {
    /// Rebuilds every account when absent.
    #[serde(default)]
    pub account_id: Option<String>
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildPermissionsResponse {
    pub accounts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted: Option<u64>
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: Uuid
}

/// Health check endpoint.
///
/// Returns 200 if the server can reach the database.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(e) = state.database.ping().await {
        tracing::warn!(error = %e, "Database health check failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy".to_string(),
                database: "disconnected".to_string()
            })
        );
    }

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            database: "connected".to_string()
        })
    )
}

/// Prometheus text exposition of the job gauges and counters.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render()
    )
}

/// POST /api/sync-connection
///
/// Queues an out-of-band sync for one connection.
pub async fn sync_connection(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<SyncConnectionRequest>, JsonRejection>
) -> Result<Json<JobResponse>> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    let connection = state
        .store
        .get_connection(request.connection_id)
        .await?
        .ok_or(ApiError::ConnectionNotFound {
            id: request.connection_id
        })?;

    let job_id = state
        .connections
        .create_jobs(std::slice::from_ref(&connection))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Internal("no job was created".to_string()))?;

    tracing::info!(connection_id = connection.id, %job_id, "Connection sync triggered via API");
    Ok(Json(JobResponse { job_id }))
}

/// POST /api/index-repo
///
/// Queues an out-of-band INDEX job for one repo.
pub async fn index_repo(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<IndexRepoRequest>, JsonRejection>
) -> Result<Json<JobResponse>> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    let job_id = state
        .indexing
        .create_index_job(request.repo_id)
        .await?
        .ok_or(ApiError::RepoNotFound { id: request.repo_id })?;

    tracing::info!(repo_id = request.repo_id, %job_id, "Repo index triggered via API");
    Ok(Json(JobResponse { job_id }))
}

/// POST /api/rebuild-permissions
///
/// Grants accounts the repos whose cached collaborator lists name them,
/// without waiting for a live permission sync. Called after an account is
/// linked.
pub async fn rebuild_permissions(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<RebuildPermissionsRequest>, JsonRejection>
) -> Result<Json<RebuildPermissionsResponse>> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    let Some(account_id) = request.account_id else {
        let accounts = state.permission_cache.sync_all_from_cache().await?;
        tracing::info!(accounts, "Permission cache rebuild triggered via API");
        return Ok(Json(RebuildPermissionsResponse {
            accounts,
            granted: None
        }));
    };

    let account = state
        .store
        .get_account(&account_id)
        .await?
        .ok_or_else(|| ApiError::AccountNotFound { id: account_id.clone() })?;
    let granted = state
        .permission_cache
        .rebuild_from_cache(&account.id, &account.provider, &account.provider_account_id)
        .await?;

    tracing::info!(account_id = %account.id, granted, "Permission cache rebuild triggered via API");
    Ok(Json(RebuildPermissionsResponse {
        accounts: 1,
        granted: Some(granted)
    }))
}
