//! The database seam: what the router and engines need from a pooled connection.

use crate::error::Result;
use crate::schema::LEDGER_TABLE;
use crate::tenant::SchemaName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Object;
use serde::Serialize;
use thiserror::Error;

/// Driver-level failure, wrapped with schema and operation by callers.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ClientError(pub String);

impl From<tokio_postgres::Error> for ClientError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => ClientError(format!("{} ({})", db.message(), db.code().code())),
            None => ClientError(err.to_string()),
        }
    }
}

/// One row of a schema's version ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub version: i32,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

#[async_trait]
pub trait TenantClient: Send + Sync + 'static {
    /// Executes `;`-separated statements without parameters.
    async fn batch_execute(&self, sql: &str) -> std::result::Result<(), ClientError>;

    async fn schema_exists(&self, schema: &str) -> std::result::Result<bool, ClientError>;

    /// Every namespace in the database, tenant or not.
    async fn list_schemas(&self) -> std::result::Result<Vec<String>, ClientError>;

    async fn table_exists(
        &self,
        schema: &SchemaName,
        table: &str,
    ) -> std::result::Result<bool, ClientError>;

    async fn ensure_ledger(&self, schema: &SchemaName) -> std::result::Result<(), ClientError>;

    async fn ledger_entries(
        &self,
        schema: &SchemaName,
    ) -> std::result::Result<Vec<LedgerEntry>, ClientError>;

    /// Inserts a ledger row; an existing row for `version` is left untouched.
    async fn record_version(
        &self,
        schema: &SchemaName,
        version: i32,
        description: &str,
    ) -> std::result::Result<(), ClientError>;

    async fn search_path(&self) -> std::result::Result<String, ClientError>;
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub size: usize,
    pub available: usize,
}

/// Source of raw connections for the router.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Client: TenantClient;

    async fn checkout(&self) -> Result<Self::Client>;

    /// Hands a connection back for reuse.
    fn checkin(&self, client: Self::Client);

    /// Closes a connection instead of returning it.
    fn discard(&self, client: Self::Client);

    fn status(&self) -> PoolStatus;
}

/// deadpool-postgres connection.
pub struct PgClient(pub(crate) Object);

#[async_trait]
impl TenantClient for PgClient {
    async fn batch_execute(&self, sql: &str) -> std::result::Result<(), ClientError> {
        self.0.batch_execute(sql).await.map_err(ClientError::from)
    }

    async fn schema_exists(&self, schema: &str) -> std::result::Result<bool, ClientError> {
        let row = self
            .0
            .query_opt(
                "SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1",
                &[&schema],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn list_schemas(&self) -> std::result::Result<Vec<String>, ClientError> {
        let rows = self
            .0
            .query(
                "SELECT nspname::text FROM pg_catalog.pg_namespace ORDER BY nspname",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn table_exists(
        &self,
        schema: &SchemaName,
        table: &str,
    ) -> std::result::Result<bool, ClientError> {
        let row = self
            .0
            .query_opt(
                "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2",
                &[&schema.as_str(), &table],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn ensure_ledger(&self, schema: &SchemaName) -> std::result::Result<(), ClientError> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {}.{} (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            schema.quoted(),
            LEDGER_TABLE
        );
        self.0.batch_execute(&sql).await.map_err(ClientError::from)
    }

    async fn ledger_entries(
        &self,
        schema: &SchemaName,
    ) -> std::result::Result<Vec<LedgerEntry>, ClientError> {
        let sql = format!(
            "SELECT version, description, applied_at FROM {}.{} ORDER BY version",
            schema.quoted(),
            LEDGER_TABLE
        );
        let rows = self.0.query(sql.as_str(), &[]).await?;
        Ok(rows
            .iter()
            .map(|row| LedgerEntry {
                version: row.get(0),
                description: row.get(1),
                applied_at: row.get(2),
            })
            .collect())
    }

    async fn record_version(
        &self,
        schema: &SchemaName,
        version: i32,
        description: &str,
    ) -> std::result::Result<(), ClientError> {
        let sql = format!(
            "INSERT INTO {}.{} (version, description) VALUES ($1, $2) ON CONFLICT (version) DO NOTHING",
            schema.quoted(),
            LEDGER_TABLE
        );
        self.0
            .execute(sql.as_str(), &[&version, &description])
            .await?;
        Ok(())
    }

    async fn search_path(&self) -> std::result::Result<String, ClientError> {
        let row = self.0.query_one("SHOW search_path", &[]).await?;
        Ok(row.get(0))
    }
}
