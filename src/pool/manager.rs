use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::pool::client::{ConnectionPool, PgClient, PoolStatus};
use crate::tenant::SchemaName;
use async_trait::async_trait;
use deadpool_postgres::{
    Config as PoolConfig, ManagerConfig, Object, Pool, RecyclingMethod, Runtime,
};
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Owns the single deadpool-postgres pool every tenant schema is served from.
pub struct PoolManager {
    pool: Pool,
}

impl PoolManager {
    pub async fn new(config: &Config) -> Result<Self> {
        let shared = SchemaName::parse(&config.shared_schema)?;
        let pool = create_pool(config, &shared)?;

        // Test connection
        let client = pool.get().await.map_err(|e| GatewayError::ConnectionFailed {
            cause: e.to_string(),
        })?;

        // Simple ping query
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| GatewayError::ConnectionFailed {
                cause: format!("Ping failed: {}", e),
            })?;

        info!(
            "Connected to PostgreSQL (max {} connections, shared schema {})",
            config.max_connections, shared
        );

        Ok(Self { pool })
    }
}

#[async_trait]
impl ConnectionPool for PoolManager {
    type Client = PgClient;

    async fn checkout(&self) -> Result<PgClient> {
        let object = self.pool.get().await?;
        Ok(PgClient(object))
    }

    fn checkin(&self, client: PgClient) {
        drop(client);
    }

    fn discard(&self, client: PgClient) {
        // Detaches the connection from the pool; dropping it closes the socket.
        let raw = Object::take(client.0);
        drop(raw);
        debug!("Discarded pooled connection");
    }

    fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
        }
    }
}

fn create_pool(config: &Config, shared: &SchemaName) -> Result<Pool> {
    let mut cfg = PoolConfig::new();
    cfg.url = Some(config.database_url.clone());

    // deadpool runs this on every recycle, in addition to the router's reset
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Custom(format!(
            "SET search_path TO {}",
            shared.quoted()
        )),
    });

    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: config.max_connections as usize,
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(config.pool_timeout),
            create: Some(config.pool_timeout),
            recycle: Some(config.pool_timeout),
        },
        ..Default::default()
    });

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| GatewayError::Internal(format!("Failed to create pool: {}", e)))
}
