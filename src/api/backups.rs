use crate::api::{actor, optional_json, AppState};
use crate::backup::{self, BackupInfo, BackupReport, BackupResult, RestoreResult};
use crate::error::{GatewayError, Result};
use crate::pool::ConnectionPool;
use crate::security::AdminCaller;
use crate::tenant::{SchemaName, TenantContext, TenantId};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn backup_tenant<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
    caller: Option<Extension<AdminCaller>>,
    Path(tenant_id): Path<String>,
) -> Result<impl IntoResponse> {
    let tenant = TenantId::new(tenant_id)?;

    TenantContext::new(tenant.clone(), actor(&caller))
        .scope(async {
            let schema = state.lifecycle.require_schema(&tenant).await?;
            let result: BackupResult = state.backups.backup_tenant(&schema).await;
            let status = if result.success {
                StatusCode::CREATED
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            Ok::<_, GatewayError>((status, Json(result)))
        })
        .await
}

pub async fn backup_all<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<BackupReport>> {
    Ok(Json(state.backups.backup_all_tenants().await?))
}

#[derive(Debug, Deserialize)]
pub struct ListBackupsQuery {
    pub schema: Option<String>,
}

#[derive(Serialize)]
pub struct ListBackupsResponse {
    pub backups: Vec<BackupInfo>,
    pub count: usize,
    pub total_bytes: u64,
}

pub async fn list_backups<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
    Query(query): Query<ListBackupsQuery>,
) -> Result<Json<ListBackupsResponse>> {
    let backups = state.backups.list_backups(query.schema.as_deref())?;
    Ok(Json(ListBackupsResponse {
        count: backups.len(),
        total_bytes: backups.iter().map(|b| b.size_bytes).sum(),
        backups,
    }))
}

pub async fn delete_backup<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
    Path(filename): Path<String>,
) -> Result<StatusCode> {
    state.backups.delete_backup(&filename)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub schema: String,
}

pub async fn restore_backup<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
    caller: Option<Extension<AdminCaller>>,
    Path(filename): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<RestoreResult>> {
    let schema = SchemaName::parse(&request.schema)?;
    warn!(
        "Restore of {} from {} requested by {}",
        schema,
        filename,
        actor(&caller).map(|a| a.0).unwrap_or_else(|| "unknown".to_string())
    );
    Ok(Json(state.backups.restore_backup(&schema, &filename).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    pub older_than_days: Option<i64>,
}

#[derive(Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
    pub older_than_days: i64,
}

pub async fn cleanup_backups<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
    body: Bytes,
) -> Result<Json<CleanupResponse>> {
    let request: CleanupRequest = optional_json(&body)?;
    let days = request
        .older_than_days
        .unwrap_or_else(|| state.backups.retention_days());

    let removed = state
        .backups
        .cleanup_older_than(backup::retention_cutoff(days)?)?;
    info!("Backup cleanup removed {} files older than {} days", removed, days);

    Ok(Json(CleanupResponse {
        removed,
        older_than_days: days,
    }))
}
