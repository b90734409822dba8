mod backups;
mod health;
mod migrate;
mod tenants;

pub use backups::{
    backup_all, backup_tenant, cleanup_backups, delete_backup, list_backups, restore_backup,
};
pub use health::health_check;
pub use migrate::migrate_all;
pub use tenants::{drop_tenant, list_tenants, migrate_tenant, provision_tenant};

use crate::backup::BackupEngine;
use crate::error::{GatewayError, Result};
use crate::pool::{ConnectionPool, ConnectionRouter};
use crate::schema::{MigrationEngine, SchemaLifecycleManager};
use crate::security::{require_admin, AdminAuth, AdminCaller};
use crate::tenant::ActorId;
use axum::{
    body::Bytes,
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Everything the handlers reach, shared behind one `Arc`.
pub struct AppState<P: ConnectionPool> {
    pub router: Arc<ConnectionRouter<P>>,
    pub lifecycle: Arc<SchemaLifecycleManager<P>>,
    pub migrations: Arc<MigrationEngine<P>>,
    pub backups: Arc<BackupEngine>,
    pub started: Instant,
}

impl<P: ConnectionPool> AppState<P> {
    pub fn new(
        router: Arc<ConnectionRouter<P>>,
        lifecycle: Arc<SchemaLifecycleManager<P>>,
        migrations: Arc<MigrationEngine<P>>,
        backups: Arc<BackupEngine>,
    ) -> Self {
        Self {
            router,
            lifecycle,
            migrations,
            backups,
            started: Instant::now(),
        }
    }
}

fn actor(caller: &Option<Extension<AdminCaller>>) -> Option<ActorId> {
    caller
        .as_ref()
        .map(|Extension(AdminCaller(ip))| ActorId::new(format!("admin@{}", ip)))
}

/// Decodes a JSON body that may be left out entirely. An empty body yields
/// the defaults; anything else must parse.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| GatewayError::InvalidRequest {
        message: format!("Malformed JSON body: {}", e),
    })
}

/// `/health` plus the authenticated `/admin` surface.
pub fn router<P: ConnectionPool>(state: Arc<AppState<P>>, auth: Arc<AdminAuth>) -> Router {
    let admin = Router::new()
        .route("/tenants", get(list_tenants::<P>).post(provision_tenant::<P>))
        .route("/tenants/:tenant_id", delete(drop_tenant::<P>))
        .route("/tenants/:tenant_id/migrate", post(migrate_tenant::<P>))
        .route("/tenants/:tenant_id/backup", post(backup_tenant::<P>))
        .route("/migrate", post(migrate_all::<P>))
        .route("/backups", get(list_backups::<P>).post(backup_all::<P>))
        .route("/backups/cleanup", post(cleanup_backups::<P>))
        .route("/backups/:filename", delete(delete_backup::<P>))
        .route("/backups/:filename/restore", post(restore_backup::<P>))
        .route_layer(middleware::from_fn_with_state(auth, require_admin))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health_check::<P>))
        .with_state(state)
        .nest("/admin", admin)
        .layer(TraceLayer::new_for_http())
}
