use crate::error::{GatewayError, Result};
use crate::pool::{
    ConnectionPool, ConnectionRouter, RoutedConnection, TenantClient, TenantDirectory,
};
use crate::schema::script::split_statements;
use crate::tenant::{SchemaLocks, SchemaName, TenantId};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates, inspects and drops tenant schemas.
pub struct SchemaLifecycleManager<P: ConnectionPool> {
    router: Arc<ConnectionRouter<P>>,
    locks: Arc<SchemaLocks>,
    template_path: PathBuf,
    transactional: bool,
}

impl<P: ConnectionPool> SchemaLifecycleManager<P> {
    pub fn new(
        router: Arc<ConnectionRouter<P>>,
        locks: Arc<SchemaLocks>,
        template_path: PathBuf,
        transactional: bool,
    ) -> Self {
        Self {
            router,
            locks,
            template_path,
            transactional,
        }
    }

    pub fn schema_name(&self, tenant: &TenantId) -> SchemaName {
        self.router.policy().schema_name(tenant)
    }

    fn load_template(&self, schema: &SchemaName) -> Result<Vec<String>> {
        let content = fs::read_to_string(&self.template_path).map_err(|e| {
            GatewayError::SchemaCreationFailed {
                schema: schema.to_string(),
                cause: format!(
                    "Failed to read tenant template {:?}: {}",
                    self.template_path, e
                ),
            }
        })?;
        let statements = split_statements(&content);
        debug!(
            "Loaded tenant template {:?} ({} statements)",
            self.template_path,
            statements.len()
        );
        Ok(statements)
    }

    /// Creates the tenant's schema and populates it from the template.
    ///
    /// Idempotent on the namespace: an existing schema is reused and the
    /// template runs again, so templates are written with `IF NOT EXISTS`.
    pub async fn create_schema(&self, tenant: &TenantId) -> Result<SchemaName> {
        let schema = self.schema_name(tenant);
        let statements = self.load_template(&schema)?;
        let _guard = self.locks.lock(&schema).await;

        let conn = self.router.acquire_schema(None).await?;
        let created = conn
            .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema.quoted()))
            .await;
        conn.release().await;
        created.map_err(|e| GatewayError::SchemaCreationFailed {
            schema: schema.to_string(),
            cause: e.to_string(),
        })?;

        let conn = self.router.acquire_schema(Some(&schema)).await?;
        let outcome = self.run_template(&conn, &schema, &statements).await;
        conn.release().await;
        outcome?;

        info!(
            "Created schema {} for tenant {} ({} template statements)",
            schema,
            tenant,
            statements.len()
        );
        Ok(schema)
    }

    async fn run_template(
        &self,
        conn: &RoutedConnection<P>,
        schema: &SchemaName,
        statements: &[String],
    ) -> Result<()> {
        let failed = |cause: String| GatewayError::SchemaCreationFailed {
            schema: schema.to_string(),
            cause,
        };

        if self.transactional {
            conn.batch_execute("BEGIN")
                .await
                .map_err(|e| failed(e.to_string()))?;
        }

        for (idx, statement) in statements.iter().enumerate() {
            if let Err(e) = conn.batch_execute(statement).await {
                if self.transactional {
                    if let Err(rollback) = conn.batch_execute("ROLLBACK").await {
                        warn!("Rollback of template on {} failed: {}", schema, rollback);
                    }
                }
                return Err(failed(format!(
                    "template statement {} of {} failed: {}",
                    idx + 1,
                    statements.len(),
                    e
                )));
            }
        }

        if self.transactional {
            conn.batch_execute("COMMIT")
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn schema_exists(&self, schema: &SchemaName) -> Result<bool> {
        let conn = self.router.acquire_schema(None).await?;
        let exists = conn.schema_exists(schema.as_str()).await;
        conn.release().await;
        exists.map_err(|e| GatewayError::ConnectionFailed {
            cause: format!("Failed to look up schema {}: {}", schema, e),
        })
    }

    pub async fn tenant_exists(&self, tenant: &TenantId) -> Result<bool> {
        self.schema_exists(&self.schema_name(tenant)).await
    }

    /// The tenant's schema, or `SchemaNotFound` if it was never created.
    pub async fn require_schema(&self, tenant: &TenantId) -> Result<SchemaName> {
        let schema = self.schema_name(tenant);
        if !self.schema_exists(&schema).await? {
            return Err(GatewayError::SchemaNotFound {
                schema: schema.to_string(),
            });
        }
        Ok(schema)
    }

    /// Irreversibly removes the tenant's schema and everything in it.
    pub async fn drop_schema(&self, tenant: &TenantId) -> Result<SchemaName> {
        let schema = self.schema_name(tenant);
        let _guard = self.locks.lock(&schema).await;

        warn!("Dropping schema {} for tenant {}", schema, tenant);

        let conn = self.router.acquire_schema(None).await?;
        let dropped = conn
            .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema.quoted()))
            .await;
        conn.release().await;
        dropped.map_err(|e| GatewayError::SchemaDropFailed {
            schema: schema.to_string(),
            cause: e.to_string(),
        })?;

        info!("Dropped schema {}", schema);
        Ok(schema)
    }

    pub async fn list_tenant_schemas(&self) -> Result<Vec<SchemaName>> {
        self.router.list_tenant_schemas().await
    }
}
