use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid schema name '{name}': {reason}")]
    InvalidSchemaName { name: String, reason: String },

    #[error("Invalid tenant id '{tenant_id}'")]
    InvalidTenantId { tenant_id: String },

    #[error("Schema not found: {schema}")]
    SchemaNotFound { schema: String },

    #[error("Failed to switch namespace to {schema}: {cause}")]
    NamespaceSwitchFailed { schema: String, cause: String },

    #[error("Schema creation failed for {schema}: {cause}")]
    SchemaCreationFailed { schema: String, cause: String },

    #[error("Schema drop failed for {schema}: {cause}")]
    SchemaDropFailed { schema: String, cause: String },

    #[error("Migration failed in {schema}: {migration} - {cause}")]
    MigrationFailed {
        schema: String,
        migration: String,
        cause: String,
    },

    #[error("Migration discovery failed: {cause}")]
    MigrationDiscoveryFailed { cause: String },

    #[error("Duplicate migration version {version}: {first} and {second}")]
    DuplicateMigrationVersion {
        version: i32,
        first: String,
        second: String,
    },

    #[error("Backup failed for {schema}: {cause}")]
    BackupFailed { schema: String, cause: String },

    #[error("Restore failed for {schema}: {cause}")]
    RestoreFailed { schema: String, cause: String },

    #[error("Invalid backup filename '{filename}': {reason}")]
    InvalidBackupFilename { filename: String, reason: String },

    #[error("Backup not found: {filename}")]
    BackupNotFound { filename: String },

    #[error("Command {program} timed out after {timeout_secs}s")]
    CommandTimedOut { program: String, timeout_secs: u64 },

    #[error("Connection failed: {cause}")]
    ConnectionFailed { cause: String },

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Unauthorized access from IP: {ip}")]
    Unauthorized { ip: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorResponse {
    fn new(error: &str, message: String) -> Self {
        Self {
            error: error.to_string(),
            message,
            schema: None,
            cause: None,
        }
    }

    fn with_schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    fn with_cause(mut self, cause: &str) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            GatewayError::InvalidSchemaName { name, reason } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("invalid_schema_name", format!("Invalid schema name '{}'", name))
                    .with_cause(reason),
            ),
            GatewayError::InvalidTenantId { tenant_id } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("invalid_tenant_id", format!("Invalid tenant id '{}'", tenant_id)),
            ),
            GatewayError::SchemaNotFound { schema } => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("schema_not_found", format!("Schema '{}' not found", schema))
                    .with_schema(schema),
            ),
            GatewayError::NamespaceSwitchFailed { schema, cause } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new(
                    "namespace_switch_failed",
                    format!("Could not route connection to schema '{}'", schema),
                )
                .with_schema(schema)
                .with_cause(cause),
            ),
            GatewayError::SchemaCreationFailed { schema, cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new(
                    "schema_creation_failed",
                    format!("Failed to create schema '{}'", schema),
                )
                .with_schema(schema)
                .with_cause(cause),
            ),
            GatewayError::SchemaDropFailed { schema, cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("schema_drop_failed", format!("Failed to drop schema '{}'", schema))
                    .with_schema(schema)
                    .with_cause(cause),
            ),
            GatewayError::MigrationFailed {
                schema,
                migration,
                cause,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("migration_failed", format!("Migration {} failed", migration))
                    .with_schema(schema)
                    .with_cause(cause),
            ),
            GatewayError::MigrationDiscoveryFailed { cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new(
                    "migration_discovery_failed",
                    "Failed to read migration scripts".to_string(),
                )
                .with_cause(cause),
            ),
            GatewayError::DuplicateMigrationVersion { version, first, second } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new(
                    "duplicate_migration_version",
                    format!("Migration version {} is declared by {} and {}", version, first, second),
                ),
            ),
            GatewayError::BackupFailed { schema, cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("backup_failed", format!("Backup of schema '{}' failed", schema))
                    .with_schema(schema)
                    .with_cause(cause),
            ),
            GatewayError::RestoreFailed { schema, cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("restore_failed", format!("Restore of schema '{}' failed", schema))
                    .with_schema(schema)
                    .with_cause(cause),
            ),
            GatewayError::InvalidBackupFilename { filename, reason } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(
                    "invalid_backup_filename",
                    format!("Invalid backup filename '{}'", filename),
                )
                .with_cause(reason),
            ),
            GatewayError::BackupNotFound { filename } => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("backup_not_found", format!("Backup '{}' not found", filename)),
            ),
            GatewayError::CommandTimedOut { program, timeout_secs } => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::new(
                    "command_timed_out",
                    format!("{} did not finish within {}s", program, timeout_secs),
                ),
            ),
            GatewayError::ConnectionFailed { cause } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("connection_failed", "Failed to connect to database".to_string())
                    .with_cause(cause),
            ),
            GatewayError::PoolExhausted => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("pool_exhausted", "Connection pool exhausted".to_string()),
            ),
            GatewayError::Unauthorized { ip } => (
                StatusCode::FORBIDDEN,
                ErrorResponse::new("unauthorized", format!("Access denied for IP address: {}", ip)),
            ),
            GatewayError::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("invalid_request", message.clone()),
            ),
            GatewayError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("internal_error", msg.clone()),
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

impl From<tokio_postgres::Error> for GatewayError {
    fn from(err: tokio_postgres::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for GatewayError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Timeout(_) => GatewayError::PoolExhausted,
            other => GatewayError::ConnectionFailed {
                cause: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(format!("IO error: {}", err))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
