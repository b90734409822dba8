use ipnetwork::IpNetwork;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub gateway_host: String,
    pub gateway_port: u16,
    pub max_connections: u32,
    pub pool_timeout: Duration,
    pub shared_schema: String,
    pub schema_prefix: String,
    pub migrations_dir: PathBuf,
    pub template_path: PathBuf,
    pub baseline_version: i32,
    pub transactional_migrations: bool,
    pub statement_timeout: Duration,
    pub backup_dir: PathBuf,
    pub pg_dump_path: String,
    pub psql_path: String,
    pub backup_timeout: Duration,
    pub backup_retention_days: i64,
    pub backup_interval: Option<Duration>,
    pub admin_token: Option<String>,
    pub allowed_admin_ips: Vec<IpNetwork>,
    pub log_dir: PathBuf,
}

/// Settings the migration engine needs, split out of [`Config`].
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub migrations_dir: PathBuf,
    pub baseline_version: i32,
    pub transactional: bool,
}

/// Settings the backup engine needs, split out of [`Config`].
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub backup_dir: PathBuf,
    pub database_url: String,
    pub pg_dump_path: String,
    pub psql_path: String,
    pub timeout: Duration,
    pub retention_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_source<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        // Build database_url from individual fields or use DATABASE_URL if provided
        let database_url = if let Some(url) = get("DATABASE_URL") {
            url
        } else {
            let db_host = var("DB_HOST", "localhost");
            let db_port = var("DB_PORT", "5432");
            let db_name = var("DB_NAME", "kiosco");
            let db_user = var("DB_USER", "kiosco");
            let db_password = var("DB_PASSWORD", "password");

            // URL-encode password to handle special characters
            let encoded_password = urlencoding::encode(&db_password);

            format!(
                "postgres://{}:{}@{}:{}/{}",
                db_user, encoded_password, db_host, db_port, db_name
            )
        };

        let gateway_host = var("GATEWAY_HOST", "127.0.0.1");
        let gateway_port = var("GATEWAY_PORT", "9100").parse().unwrap_or(9100);

        let max_connections = var("MAX_CONNECTIONS", "20").parse().unwrap_or(20);
        let pool_timeout_secs: u64 = var("POOL_TIMEOUT_SECS", "5").parse().unwrap_or(5);

        let shared_schema = var("SHARED_SCHEMA", "public");
        let schema_prefix = var("SCHEMA_PREFIX", "tenant_");

        let migrations_dir = PathBuf::from(var("MIGRATIONS_DIR", "./db/migrations"));
        let template_path = PathBuf::from(var("TENANT_TEMPLATE_PATH", "./db/tenant_template.sql"));

        let baseline_version = var("MIGRATION_BASELINE_VERSION", "1").parse().unwrap_or(1);
        let transactional_migrations = parse_bool(&var("MIGRATION_TRANSACTIONAL", "true"));
        let statement_timeout_secs: u64 = var("MIGRATION_STATEMENT_TIMEOUT_SECS", "300")
            .parse()
            .unwrap_or(300);

        let backup_dir = PathBuf::from(var("BACKUP_DIR", "./backups"));
        let pg_dump_path = var("PG_DUMP_PATH", "pg_dump");
        let psql_path = var("PSQL_PATH", "psql");
        let backup_timeout_secs: u64 = var("BACKUP_TIMEOUT_SECS", "1800").parse().unwrap_or(1800);
        let backup_retention_days = var("BACKUP_RETENTION_DAYS", "30").parse().unwrap_or(30);

        // 0 disables the scheduled backup task
        let backup_interval_secs: u64 = var("BACKUP_INTERVAL_SECS", "0").parse().unwrap_or(0);
        let backup_interval = if backup_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(backup_interval_secs))
        };

        // Admin authentication (optional)
        let admin_token = get("ADMIN_TOKEN").filter(|t| !t.trim().is_empty());
        let allowed_admin_ips = parse_networks(&var("ALLOWED_ADMIN_IPS", "127.0.0.0/8,::1/128"));

        let log_dir = PathBuf::from(var("LOG_DIR", "/var/log/kioscodb-gateway"));

        if schema_prefix.is_empty() {
            anyhow::bail!("SCHEMA_PREFIX must not be empty");
        }

        Ok(Config {
            database_url,
            gateway_host,
            gateway_port,
            max_connections,
            pool_timeout: Duration::from_secs(pool_timeout_secs),
            shared_schema,
            schema_prefix,
            migrations_dir,
            template_path,
            baseline_version,
            transactional_migrations,
            statement_timeout: Duration::from_secs(statement_timeout_secs),
            backup_dir,
            pg_dump_path,
            psql_path,
            backup_timeout: Duration::from_secs(backup_timeout_secs),
            backup_retention_days,
            backup_interval,
            admin_token,
            allowed_admin_ips,
            log_dir,
        })
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.gateway_host, self.gateway_port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("Invalid socket address: {}", e))
    }

    pub fn migration(&self) -> MigrationConfig {
        MigrationConfig {
            migrations_dir: self.migrations_dir.clone(),
            baseline_version: self.baseline_version,
            transactional: self.transactional_migrations,
        }
    }

    pub fn backup(&self) -> BackupConfig {
        BackupConfig {
            backup_dir: self.backup_dir.clone(),
            database_url: self.database_url.clone(),
            pg_dump_path: self.pg_dump_path.clone(),
            psql_path: self.psql_path.clone(),
            timeout: self.backup_timeout,
            retention_days: self.backup_retention_days,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_networks(value: &str) -> Vec<IpNetwork> {
    value
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                IpNetwork::from_str(trimmed).ok()
            }
        })
        .collect()
}
