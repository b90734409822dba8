//! Tenant-aware connection routing.
//!
//! Every connection leaves the router with its search path pinned to
//! `[tenant schema, shared schema]` (or just the shared schema) and comes back
//! reset to the shared schema. A connection whose switch or reset fails is
//! discarded rather than returned to the pool, and so is a [`RoutedConnection`]
//! dropped without [`RoutedConnection::release`].

use crate::error::{GatewayError, Result};
use crate::pool::client::{ConnectionPool, TenantClient};
use crate::tenant::{SchemaName, SchemaNamingPolicy, TenantContext, TenantId};
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ConnectionRouter<P: ConnectionPool> {
    pool: Arc<P>,
    policy: SchemaNamingPolicy,
    shared: SchemaName,
    statement_timeout: Option<Duration>,
}

impl<P: ConnectionPool> ConnectionRouter<P> {
    pub fn new(pool: Arc<P>, policy: SchemaNamingPolicy, shared: SchemaName) -> Self {
        Self {
            pool,
            policy,
            shared,
            statement_timeout: None,
        }
    }

    /// Bounds every statement run on routed connections.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> &SchemaNamingPolicy {
        &self.policy
    }

    pub fn shared_schema(&self) -> &SchemaName {
        &self.shared
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Explicit tenant first, then the task's [`TenantContext`], else shared.
    pub fn resolve(&self, explicit: Option<&TenantId>) -> Option<SchemaName> {
        explicit
            .cloned()
            .or_else(TenantContext::current_tenant)
            .map(|tenant| self.policy.schema_name(&tenant))
    }

    pub async fn acquire(&self, tenant: Option<&TenantId>) -> Result<RoutedConnection<P>> {
        let schema = self.resolve(tenant);
        self.acquire_schema(schema.as_ref()).await
    }

    /// Pins a connection to `schema`, or to the shared namespace for `None`.
    pub async fn acquire_schema(
        &self,
        schema: Option<&SchemaName>,
    ) -> Result<RoutedConnection<P>> {
        let client = self.pool.checkout().await?;

        let pin_sql = self.pin_sql(schema);
        if let Err(e) = client.batch_execute(&pin_sql).await {
            let target = schema.unwrap_or(&self.shared).to_string();
            warn!("Namespace switch to {} failed, discarding connection: {}", target, e);
            self.pool.discard(client);
            return Err(GatewayError::NamespaceSwitchFailed {
                schema: target,
                cause: e.to_string(),
            });
        }

        debug!(
            "Routed connection to {}",
            schema.unwrap_or(&self.shared)
        );

        Ok(RoutedConnection {
            client: Some(client),
            pool: self.pool.clone(),
            schema: schema.cloned(),
            reset_sql: self.reset_sql(),
        })
    }

    pub async fn release(&self, connection: RoutedConnection<P>) {
        connection.release().await;
    }

    fn pin_sql(&self, schema: Option<&SchemaName>) -> String {
        let mut sql = match schema {
            Some(schema) if *schema != self.shared => format!(
                "SET search_path TO {}, {}",
                schema.quoted(),
                self.shared.quoted()
            ),
            _ => format!("SET search_path TO {}", self.shared.quoted()),
        };
        if let Some(timeout) = self.statement_timeout {
            sql.push_str(&format!("; SET statement_timeout = {}", timeout.as_millis()));
        }
        sql
    }

    fn reset_sql(&self) -> String {
        let mut sql = format!("SET search_path TO {}", self.shared.quoted());
        if self.statement_timeout.is_some() {
            sql.push_str("; RESET statement_timeout");
        }
        sql
    }
}

/// A pooled connection pinned to one namespace.
pub struct RoutedConnection<P: ConnectionPool> {
    client: Option<P::Client>,
    pool: Arc<P>,
    schema: Option<SchemaName>,
    reset_sql: String,
}

impl<P: ConnectionPool> RoutedConnection<P> {
    /// `None` when pinned to the shared namespace.
    pub fn schema(&self) -> Option<&SchemaName> {
        self.schema.as_ref()
    }

    /// Resets the namespace and returns the connection to the pool.
    /// Never fails: a connection that cannot be reset is discarded.
    pub async fn release(mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        match client.batch_execute(&self.reset_sql).await {
            Ok(()) => self.pool.checkin(client),
            Err(e) => {
                warn!(
                    "Failed to reset namespace after {}, discarding connection: {}",
                    self.schema
                        .as_ref()
                        .map(SchemaName::as_str)
                        .unwrap_or("shared work"),
                    e
                );
                self.pool.discard(client);
            }
        }
    }
}

impl<P: ConnectionPool> Deref for RoutedConnection<P> {
    type Target = P::Client;

    fn deref(&self) -> &P::Client {
        self.client
            .as_ref()
            .expect("routed connection used after release")
    }
}

impl<P: ConnectionPool> Drop for RoutedConnection<P> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!(
                "Routed connection for {} dropped without release, discarding",
                self.schema
                    .as_ref()
                    .map(SchemaName::as_str)
                    .unwrap_or("shared work")
            );
            self.pool.discard(client);
        }
    }
}

/// Enumerates tenant schemas present in the database.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list_tenant_schemas(&self) -> Result<Vec<SchemaName>>;
}

#[async_trait]
impl<P: ConnectionPool> TenantDirectory for ConnectionRouter<P> {
    async fn list_tenant_schemas(&self) -> Result<Vec<SchemaName>> {
        let conn = self.acquire_schema(None).await?;
        let listed = conn.list_schemas().await;
        conn.release().await;

        let names = listed.map_err(|e| GatewayError::ConnectionFailed {
            cause: format!("Failed to list schemas: {}", e),
        })?;

        Ok(names
            .iter()
            .filter(|name| self.policy.is_tenant_schema(name))
            .filter_map(|name| SchemaName::parse(name).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::MemoryPool;
    use crate::tenant::ActorId;

    fn router(pool: &Arc<MemoryPool>) -> ConnectionRouter<MemoryPool> {
        ConnectionRouter::new(
            pool.clone(),
            SchemaNamingPolicy::default(),
            SchemaName::parse("public").unwrap(),
        )
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_pins_tenant_then_shared() {
        let pool = Arc::new(MemoryPool::new());
        let router = router(&pool);
        let t1 = tenant("t1");
        let schema = router.policy().schema_name(&t1);

        let conn = router.acquire(Some(&t1)).await.unwrap();
        assert_eq!(conn.schema(), Some(&schema));
        assert_eq!(
            conn.search_path().await.unwrap(),
            format!("{}, \"public\"", schema.quoted())
        );
        router.release(conn).await;
    }

    #[tokio::test]
    async fn test_reused_connection_never_keeps_previous_tenant() {
        let pool = Arc::new(MemoryPool::new());
        let router = router(&pool);
        let t1 = tenant("t1");
        let schema = router.policy().schema_name(&t1);

        let conn = router.acquire(Some(&t1)).await.unwrap();
        let first_id = conn.id();
        conn.release().await;
        assert_eq!(pool.idle_count(), 1);

        let reused = router.acquire(None).await.unwrap();
        assert_eq!(reused.id(), first_id);
        let path = reused.search_path().await.unwrap();
        assert!(!path.contains(schema.as_str()));
        assert_eq!(path, "\"public\"");
        reused.release().await;

        // Even without a new switch, the parked connection is already reset
        let parked = pool.peek_idle_search_path().unwrap();
        assert_eq!(parked, "\"public\"");
    }

    #[tokio::test]
    async fn test_switch_failure_discards_connection() {
        let pool = Arc::new(MemoryPool::new());
        pool.fail_on(None, "SET search_path TO \"tenant_");
        let router = router(&pool);

        let err = router.acquire(Some(&tenant("t1"))).await.err().unwrap();
        assert!(matches!(err, GatewayError::NamespaceSwitchFailed { .. }));
        assert_eq!(pool.discarded(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_failure_discards_without_error() {
        let pool = Arc::new(MemoryPool::new());
        let router = router(&pool);

        let conn = router.acquire(Some(&tenant("t1"))).await.unwrap();
        pool.fail_on(None, "SET search_path TO \"public\"");
        conn.release().await;

        assert_eq!(pool.discarded(), 1);
        assert_eq!(pool.idle_count(), 0);

        pool.clear_failures();
        let fresh = router.acquire(None).await.unwrap();
        assert_eq!(pool.created(), 2);
        fresh.release().await;
    }

    #[tokio::test]
    async fn test_drop_without_release_discards() {
        let pool = Arc::new(MemoryPool::new());
        let router = router(&pool);

        {
            let _conn = router.acquire(Some(&tenant("t1"))).await.unwrap();
        }

        assert_eq!(pool.discarded(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let pool = Arc::new(MemoryPool::new());
        let router = router(&pool);
        let t1 = tenant("t1");
        let t2 = tenant("t2");
        let s1 = router.policy().schema_name(&t1);
        let s2 = router.policy().schema_name(&t2);

        assert_eq!(router.resolve(None), None);

        TenantContext::new(t1.clone(), Some(ActorId::new("api")))
            .scope(async {
                assert_eq!(router.resolve(Some(&t2)), Some(s2.clone()));
                assert_eq!(router.resolve(None), Some(s1.clone()));

                let conn = router.acquire(None).await.unwrap();
                assert_eq!(conn.schema(), Some(&s1));
                conn.release().await;
            })
            .await;

        let conn = router.acquire(None).await.unwrap();
        assert_eq!(conn.schema(), None);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_statement_timeout_is_set_and_reset() {
        let pool = Arc::new(MemoryPool::new());
        let router = router(&pool).with_statement_timeout(Duration::from_millis(1500));

        let conn = router.acquire(Some(&tenant("t1"))).await.unwrap();
        assert_eq!(conn.statement_timeout(), Some("1500".to_string()));
        conn.release().await;
        assert_eq!(pool.peek_idle_statement_timeout(), None);
    }

    #[tokio::test]
    async fn test_list_tenant_schemas_filters_by_prefix() {
        let pool = Arc::new(MemoryPool::new());
        pool.add_schema("tenant_aaa");
        pool.add_schema("tenant_bbb");
        pool.add_schema("reporting");
        let router = router(&pool);

        let schemas = router.list_tenant_schemas().await.unwrap();
        let names: Vec<&str> = schemas.iter().map(SchemaName::as_str).collect();
        assert_eq!(names, vec!["tenant_aaa", "tenant_bbb"]);
        assert_eq!(pool.idle_count(), 1);
    }
}
