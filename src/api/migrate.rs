use crate::api::AppState;
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::schema::MigrationReport;
use axum::{extract::State, Json};
use std::sync::Arc;

/// Always answers with the report; per-tenant failures are inside it.
pub async fn migrate_all<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<MigrationReport>> {
    let report = state.migrations.migrate_all_tenants().await?;
    Ok(Json(report))
}
