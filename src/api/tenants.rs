use crate::api::{actor, optional_json, AppState};
use crate::error::{GatewayError, Result};
use crate::pool::ConnectionPool;
use crate::schema::{TenantMigrationResult, TenantVersionStatus};
use crate::security::AdminCaller;
use crate::tenant::{TenantContext, TenantId};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Serialize)]
pub struct ListTenantsResponse {
    pub tenants: Vec<TenantVersionStatus>,
    pub count: usize,
}

pub async fn list_tenants<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<ListTenantsResponse>> {
    let tenants = state.migrations.tenant_status().await?;
    let count = tenants.len();
    Ok(Json(ListTenantsResponse { tenants, count }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProvisionTenantRequest {
    pub tenant_id: Option<String>,
}

#[derive(Serialize)]
pub struct ProvisionTenantResponse {
    pub tenant_id: TenantId,
    pub schema: String,
    pub migration: TenantMigrationResult,
}

/// Creates the tenant's schema from the template, then brings it to the
/// latest migration.
pub async fn provision_tenant<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
    caller: Option<Extension<AdminCaller>>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let request: ProvisionTenantRequest = optional_json(&body)?;
    let tenant = match request.tenant_id {
        Some(id) => TenantId::new(id)?,
        None => TenantId::generate(),
    };

    let context = TenantContext::new(tenant.clone(), actor(&caller));
    context
        .scope(async {
            let schema = state.lifecycle.create_schema(&tenant).await?;
            let migration = state.migrations.migrate_tenant(&schema).await?;

            let status = if migration.success {
                info!("Provisioned tenant {} in {}", tenant, schema);
                StatusCode::CREATED
            } else {
                warn!(
                    "Tenant {} created in {} but migration failed: {:?}",
                    tenant, schema, migration.error
                );
                StatusCode::INTERNAL_SERVER_ERROR
            };

            Ok::<_, GatewayError>((
                status,
                Json(ProvisionTenantResponse {
                    tenant_id: tenant.clone(),
                    schema: schema.to_string(),
                    migration,
                }),
            ))
        })
        .await
}

#[derive(Serialize)]
pub struct DropTenantResponse {
    pub tenant_id: TenantId,
    pub schema: String,
    pub status: String,
}

pub async fn drop_tenant<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
    caller: Option<Extension<AdminCaller>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<DropTenantResponse>> {
    let tenant = TenantId::new(tenant_id)?;
    let schema = state.lifecycle.require_schema(&tenant).await?;

    warn!(
        "Tenant {} ({}) drop requested by {}",
        tenant,
        schema,
        actor(&caller).map(|a| a.0).unwrap_or_else(|| "unknown".to_string())
    );
    state.lifecycle.drop_schema(&tenant).await?;

    Ok(Json(DropTenantResponse {
        tenant_id: tenant,
        schema: schema.to_string(),
        status: "dropped".to_string(),
    }))
}

pub async fn migrate_tenant<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
    caller: Option<Extension<AdminCaller>>,
    Path(tenant_id): Path<String>,
) -> Result<impl IntoResponse> {
    let tenant = TenantId::new(tenant_id)?;

    TenantContext::new(tenant.clone(), actor(&caller))
        .scope(async {
            let schema = state.lifecycle.require_schema(&tenant).await?;
            let result = state.migrations.migrate_tenant(&schema).await?;
            let status = if result.success {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            Ok::<_, GatewayError>((status, Json(result)))
        })
        .await
}
