use crate::config::MigrationConfig;
use crate::error::{GatewayError, Result};
use crate::pool::{
    ClientError, ConnectionPool, ConnectionRouter, LedgerEntry, RoutedConnection, TenantClient,
    TenantDirectory,
};
use crate::schema::script::{MigrationScript, MigrationSet};
use crate::tenant::{SchemaLocks, SchemaName};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Version ledger kept inside every tenant schema.
pub const LEDGER_TABLE: &str = "schema_version";

#[derive(Debug, Clone, Serialize)]
pub struct TenantMigrationResult {
    pub schema: String,
    pub success: bool,
    pub previous_version: i32,
    pub new_version: i32,
    pub applied_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TenantMigrationResult {
    fn failed(
        schema: &SchemaName,
        previous: i32,
        reached: i32,
        applied: usize,
        err: String,
    ) -> Self {
        Self {
            schema: schema.to_string(),
            success: false,
            previous_version: previous,
            new_version: reached,
            applied_count: applied,
            error: Some(err),
        }
    }

    /// Succeeded without applying anything.
    pub fn is_skipped(&self) -> bool {
        self.success && self.applied_count == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub latest_version: i32,
    pub results: Vec<TenantMigrationResult>,
    pub duration_ms: u64,
}

impl MigrationReport {
    fn from_results(
        results: Vec<TenantMigrationResult>,
        latest_version: i32,
        started: Instant,
    ) -> Self {
        let skipped = results.iter().filter(|r| r.is_skipped()).count();
        let failed = results.iter().filter(|r| !r.success).count();
        Self {
            total: results.len(),
            successful: results.len() - failed - skipped,
            failed,
            skipped,
            latest_version,
            results,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantVersionStatus {
    pub schema: String,
    pub current_version: i32,
    pub latest_version: i32,
    pub pending: usize,
}

/// Applies versioned scripts to tenant schemas, tracked per schema in
/// [`LEDGER_TABLE`].
pub struct MigrationEngine<P: ConnectionPool> {
    router: Arc<ConnectionRouter<P>>,
    locks: Arc<SchemaLocks>,
    config: MigrationConfig,
}

impl<P: ConnectionPool> MigrationEngine<P> {
    pub fn new(
        router: Arc<ConnectionRouter<P>>,
        locks: Arc<SchemaLocks>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            router,
            locks,
            config,
        }
    }

    /// Scans the migrations directory. Done per operation so new files are
    /// picked up without a restart.
    pub fn load_migrations(&self) -> Result<MigrationSet> {
        MigrationSet::load(&self.config.migrations_dir)
    }

    pub async fn list_tenant_schemas(&self) -> Result<Vec<SchemaName>> {
        self.router.list_tenant_schemas().await
    }

    /// Whether the ledger exists, and the highest version recorded in it.
    async fn ledger_state(&self, schema: &SchemaName) -> Result<(bool, i32)> {
        let conn = self.router.acquire_schema(None).await?;
        let state = async {
            if !conn.table_exists(schema, LEDGER_TABLE).await? {
                return Ok((false, 0));
            }
            let entries = conn.ledger_entries(schema).await?;
            Ok::<_, ClientError>((true, entries.iter().map(|e| e.version).max().unwrap_or(0)))
        }
        .await;
        conn.release().await;

        state.map_err(|e| GatewayError::ConnectionFailed {
            cause: format!("Failed to read version ledger of {}: {}", schema, e),
        })
    }

    /// Highest recorded version, 0 for a schema without a ledger.
    pub async fn current_version(&self, schema: &SchemaName) -> Result<i32> {
        Ok(self.ledger_state(schema).await?.1)
    }

    pub fn latest_available_version(&self) -> Result<i32> {
        Ok(self.load_migrations()?.latest_version())
    }

    /// Scripts a migration run would apply, in version order.
    ///
    /// A schema without a ledger is assumed to hold the baseline, so only
    /// scripts above `baseline_version` are listed even though
    /// [`current_version`](Self::current_version) reports 0 for it.
    pub async fn pending_migrations(&self, schema: &SchemaName) -> Result<Vec<MigrationScript>> {
        let set = self.load_migrations()?;
        let (tracked, current) = self.ledger_state(schema).await?;
        Ok(set.pending_after(self.floor(tracked, current)))
    }

    pub async fn ledger(&self, schema: &SchemaName) -> Result<Vec<LedgerEntry>> {
        let conn = self.router.acquire_schema(None).await?;
        let entries = async {
            if !conn.table_exists(schema, LEDGER_TABLE).await? {
                return Ok(Vec::new());
            }
            conn.ledger_entries(schema).await
        }
        .await;
        conn.release().await;

        entries.map_err(|e| GatewayError::ConnectionFailed {
            cause: format!("Failed to read version ledger of {}: {}", schema, e),
        })
    }

    /// Untracked schemas count as already holding the baseline versions.
    fn floor(&self, tracked: bool, current: i32) -> i32 {
        if tracked {
            current
        } else {
            current.max(self.config.baseline_version)
        }
    }

    /// Migrates one schema. Per-schema failures are reported in the result;
    /// an unknown schema or unreadable migrations directory is an error.
    pub async fn migrate_tenant(&self, schema: &SchemaName) -> Result<TenantMigrationResult> {
        let set = self.load_migrations()?;

        let conn = self.router.acquire_schema(None).await?;
        let exists = conn.schema_exists(schema.as_str()).await;
        conn.release().await;
        let exists = exists.map_err(|e| GatewayError::ConnectionFailed {
            cause: e.to_string(),
        })?;
        if !exists {
            return Err(GatewayError::SchemaNotFound {
                schema: schema.to_string(),
            });
        }

        Ok(self.migrate_with(&set, schema).await)
    }

    /// Migrates every tenant schema in turn, continuing past failures.
    pub async fn migrate_all_tenants(&self) -> Result<MigrationReport> {
        let started = Instant::now();
        let set = self.load_migrations()?;
        let schemas = self.list_tenant_schemas().await?;

        info!(
            "Migrating {} tenant schemas to version {}",
            schemas.len(),
            set.latest_version()
        );

        let mut results = Vec::with_capacity(schemas.len());
        for schema in &schemas {
            results.push(self.migrate_with(&set, schema).await);
        }

        let report = MigrationReport::from_results(results, set.latest_version(), started);
        info!(
            "Migration run finished: {} migrated, {} up to date, {} failed ({} ms)",
            report.successful, report.skipped, report.failed, report.duration_ms
        );
        Ok(report)
    }

    pub async fn tenant_status(&self) -> Result<Vec<TenantVersionStatus>> {
        let set = self.load_migrations()?;
        let latest = set.latest_version();

        let mut statuses = Vec::new();
        for schema in self.list_tenant_schemas().await? {
            let (tracked, current) = self.ledger_state(&schema).await?;
            statuses.push(TenantVersionStatus {
                schema: schema.to_string(),
                current_version: current,
                latest_version: latest,
                pending: set.pending_after(self.floor(tracked, current)).len(),
            });
        }
        Ok(statuses)
    }

    async fn migrate_with(&self, set: &MigrationSet, schema: &SchemaName) -> TenantMigrationResult {
        let _guard = self.locks.lock(schema).await;

        let (tracked, previous) = match self.ledger_state(schema).await {
            Ok(state) => state,
            Err(e) => {
                error!("Cannot read version of {}: {}", schema, e);
                return TenantMigrationResult::failed(schema, 0, 0, 0, e.to_string());
            }
        };

        let pending = set.pending_after(self.floor(tracked, previous));
        if tracked && pending.is_empty() {
            debug!("Schema {} is up to date at version {}", schema, previous);
            return TenantMigrationResult {
                schema: schema.to_string(),
                success: true,
                previous_version: previous,
                new_version: previous,
                applied_count: 0,
                error: None,
            };
        }

        let conn = match self.router.acquire_schema(Some(schema)).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Cannot pin connection to {}: {}", schema, e);
                return TenantMigrationResult::failed(
                    schema,
                    previous,
                    previous,
                    0,
                    e.to_string(),
                );
            }
        };

        let mut reached = previous;
        let mut applied = 0;
        let outcome = async {
            if !tracked {
                reached = self.bootstrap_ledger(&conn, set, schema).await?;
            }
            for script in &pending {
                self.apply_script(&conn, schema, script).await?;
                reached = script.version;
                applied += 1;
            }
            Ok::<(), GatewayError>(())
        }
        .await;
        conn.release().await;

        match outcome {
            Ok(()) => {
                if applied > 0 {
                    info!(
                        "Migrated {} from version {} to {} ({} scripts)",
                        schema, previous, reached, applied
                    );
                }
                TenantMigrationResult {
                    schema: schema.to_string(),
                    success: true,
                    previous_version: previous,
                    new_version: reached,
                    applied_count: applied,
                    error: None,
                }
            }
            Err(e) => {
                error!("Migration of {} stopped at version {}: {}", schema, reached, e);
                TenantMigrationResult::failed(schema, previous, reached, applied, e.to_string())
            }
        }
    }

    /// Creates the ledger of a pre-tracking schema and records the baseline
    /// versions it already has structurally.
    async fn bootstrap_ledger(
        &self,
        conn: &RoutedConnection<P>,
        set: &MigrationSet,
        schema: &SchemaName,
    ) -> Result<i32> {
        let baseline = self.config.baseline_version;
        let failed = |cause: String| GatewayError::MigrationFailed {
            schema: schema.to_string(),
            migration: "ledger bootstrap".to_string(),
            cause,
        };

        warn!(
            "Schema {} has no version ledger, seeding versions 1..={}",
            schema, baseline
        );

        self.in_transaction(conn, schema, "ledger bootstrap", async {
            conn.ensure_ledger(schema)
                .await
                .map_err(|e| failed(e.to_string()))?;
            for version in 1..=baseline {
                let description = set
                    .get(version)
                    .map(|s| s.description.as_str())
                    .unwrap_or("baseline");
                conn.record_version(schema, version, description)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
            }
            Ok::<(), GatewayError>(())
        })
        .await?;

        Ok(baseline.max(0))
    }

    async fn apply_script(
        &self,
        conn: &RoutedConnection<P>,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<()> {
        let failed = |cause: String| GatewayError::MigrationFailed {
            schema: schema.to_string(),
            migration: script.filename.clone(),
            cause,
        };

        debug!(
            "Applying {} to {} ({} statements)",
            script.filename,
            schema,
            script.statements.len()
        );

        self.in_transaction(conn, schema, &script.filename, async {
            for statement in &script.statements {
                conn.batch_execute(statement)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
            }
            conn.record_version(schema, script.version, &script.description)
                .await
                .map_err(|e| failed(format!("recording version failed: {}", e)))?;
            Ok::<(), GatewayError>(())
        })
        .await?;

        info!(
            "Applied migration {} to {} (checksum: {})",
            script.filename, schema, script.checksum
        );
        Ok(())
    }

    /// Runs `work` inside BEGIN/COMMIT when transactional migrations are on.
    async fn in_transaction<F>(
        &self,
        conn: &RoutedConnection<P>,
        schema: &SchemaName,
        label: &str,
        work: F,
    ) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        if !self.config.transactional {
            return work.await;
        }

        let tx_failed = |cause: String| GatewayError::MigrationFailed {
            schema: schema.to_string(),
            migration: label.to_string(),
            cause,
        };

        conn.batch_execute("BEGIN")
            .await
            .map_err(|e| tx_failed(e.to_string()))?;

        if let Err(e) = work.await {
            if let Err(rollback) = conn.batch_execute("ROLLBACK").await {
                warn!("Rollback of {} on {} failed: {}", label, schema, rollback);
            }
            return Err(e);
        }

        conn.batch_execute("COMMIT")
            .await
            .map_err(|e| tx_failed(format!("commit failed: {}", e)))
    }
}
