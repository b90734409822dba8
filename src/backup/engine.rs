use crate::backup::catalog::{self, BackupInfo};
use crate::backup::command::{ExternalCommand, CHUNK_SIZE};
use crate::config::BackupConfig;
use crate::error::{GatewayError, Result};
use crate::pool::TenantDirectory;
use crate::tenant::{SchemaLocks, SchemaName, SchemaNamingPolicy};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_postgres::config::Host;
use tracing::{debug, error, info, warn};

// Chunks in flight between a tool's pipe and the gzip thread
const CHANNEL_DEPTH: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub schema: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BackupResult>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub schema: String,
    pub filename: String,
    pub duration_ms: u64,
}

/// Per-schema logical backups through `pg_dump`, restores through `psql`.
pub struct BackupEngine {
    config: BackupConfig,
    directory: Arc<dyn TenantDirectory>,
    policy: SchemaNamingPolicy,
    locks: Arc<SchemaLocks>,
}

impl BackupEngine {
    pub fn new(
        config: BackupConfig,
        directory: Arc<dyn TenantDirectory>,
        policy: SchemaNamingPolicy,
        locks: Arc<SchemaLocks>,
    ) -> Self {
        Self {
            config,
            directory,
            policy,
            locks,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    pub fn retention_days(&self) -> i64 {
        self.config.retention_days
    }

    /// Dumps one schema. Failures are reported in the result, never raised.
    pub async fn backup_tenant(&self, schema: &SchemaName) -> BackupResult {
        let started = Instant::now();
        let _guard = self.locks.lock(schema).await;
        let timestamp = Utc::now();

        match self.dump(schema, timestamp).await {
            Ok((filename, size)) => {
                info!("Backed up {} to {} ({} bytes)", schema, filename, size);
                BackupResult {
                    schema: schema.to_string(),
                    success: true,
                    timestamp,
                    filename: Some(filename),
                    size_bytes: Some(size),
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                }
            }
            Err(e) => {
                error!("Backup of {} failed: {}", schema, e);
                BackupResult {
                    schema: schema.to_string(),
                    success: false,
                    timestamp,
                    filename: None,
                    size_bytes: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn dump(&self, schema: &SchemaName, at: DateTime<Utc>) -> Result<(String, u64)> {
        let failed = |cause: String| GatewayError::BackupFailed {
            schema: schema.to_string(),
            cause,
        };

        let command = self
            .with_connection(
                ExternalCommand::new(&self.config.pg_dump_path, self.config.timeout)
                    .arg(format!("--schema={}", schema.as_str()))
                    .arg("--no-owner")
                    .arg("--no-privileges"),
            )
            .map_err(failed)?;

        fs::create_dir_all(&self.config.backup_dir).map_err(|e| {
            failed(format!(
                "cannot create backup directory {:?}: {}",
                self.config.backup_dir, e
            ))
        })?;

        let filename = catalog::backup_filename(schema, at);
        let path = self.config.backup_dir.join(&filename);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| failed(format!("cannot create {}: {}", filename, e)))?;

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let writer = tokio::task::spawn_blocking(move || compress_into(file, rx));
        let outcome = command.run_with_output(tx).await;
        let written = writer
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e.to_string())));

        let cause = match (&outcome, &written) {
            (_, Err(e)) => Some(format!("cannot write {}: {}", filename, e)),
            (Err(e), _) => Some(e.to_string()),
            (Ok(outcome), _) if !outcome.success() => Some(outcome.failure_message()),
            _ => None,
        };
        if let Some(cause) = cause {
            remove_partial(&path);
            return Err(failed(cause));
        }
        if let Ok(outcome) = &outcome {
            if !outcome.stderr.trim().is_empty() {
                debug!("pg_dump stderr for {}: {}", schema, outcome.stderr.trim());
            }
        }

        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok((filename, size))
    }

    /// Adds connection arguments taken from `DATABASE_URL`. The password goes
    /// through `PGPASSWORD` so it never shows up in the process list.
    fn with_connection(
        &self,
        mut command: ExternalCommand,
    ) -> std::result::Result<ExternalCommand, String> {
        let url = self
            .config
            .database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| format!("invalid DATABASE_URL: {}", e))?;

        if let Some(host) = url.get_hosts().first() {
            command = match host {
                Host::Tcp(name) => command.arg(format!("--host={}", name)),
                #[cfg(unix)]
                Host::Unix(dir) => command.arg(format!("--host={}", dir.display())),
            };
        }
        if let Some(port) = url.get_ports().first() {
            command = command.arg(format!("--port={}", port));
        }
        if let Some(user) = url.get_user() {
            command = command.arg(format!("--username={}", user));
        }
        if let Some(password) = url.get_password() {
            command = command.env("PGPASSWORD", String::from_utf8_lossy(password));
        }
        if let Some(dbname) = url.get_dbname() {
            command = command.arg(format!("--dbname={}", dbname));
        }
        Ok(command)
    }

    /// Backs up every tenant schema in turn, continuing past failures.
    pub async fn backup_all_tenants(&self) -> Result<BackupReport> {
        let started = Instant::now();
        let schemas = self.directory.list_tenant_schemas().await?;
        info!("Backing up {} tenant schemas", schemas.len());

        let mut results = Vec::with_capacity(schemas.len());
        for schema in &schemas {
            results.push(self.backup_tenant(schema).await);
        }

        let failed = results.iter().filter(|r| !r.success).count();
        let report = BackupReport {
            total: results.len(),
            successful: results.len() - failed,
            failed,
            results,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Backup run finished: {} succeeded, {} failed ({} ms)",
            report.successful, report.failed, report.duration_ms
        );
        Ok(report)
    }

    pub fn list_backups(&self, schema: Option<&str>) -> Result<Vec<BackupInfo>> {
        catalog::list_backups(&self.config.backup_dir, schema)
    }

    fn backup_path(&self, filename: &str) -> Result<(PathBuf, String)> {
        let (schema, _) = catalog::validate_backup_filename(filename)?;
        let path = self.config.backup_dir.join(filename);
        if !path.is_file() {
            return Err(GatewayError::BackupNotFound {
                filename: filename.to_string(),
            });
        }
        Ok((path, schema))
    }

    /// Replaces `schema` with the contents of `filename`.
    ///
    /// Destructive: the schema is dropped and recreated inside a single psql
    /// transaction. No backup of the current contents is taken first.
    pub async fn restore_backup(
        &self,
        schema: &SchemaName,
        filename: &str,
    ) -> Result<RestoreResult> {
        let started = Instant::now();
        let target = self.policy.tenant_schema(schema.as_str())?;
        let (path, backup_schema) = self.backup_path(filename)?;
        if backup_schema != target.as_str() {
            return Err(GatewayError::InvalidBackupFilename {
                filename: filename.to_string(),
                reason: format!(
                    "backup belongs to schema {}, not {}",
                    backup_schema, target
                ),
            });
        }

        let _guard = self.locks.lock(&target).await;
        warn!(
            "Restoring {} from {}, current contents will be replaced",
            target, filename
        );

        let failed = |cause: String| GatewayError::RestoreFailed {
            schema: target.to_string(),
            cause,
        };

        let command = self
            .with_connection(
                ExternalCommand::new(&self.config.psql_path, self.config.timeout)
                    .arg("--single-transaction")
                    .arg("--quiet")
                    .arg("-v")
                    .arg("ON_ERROR_STOP=1"),
            )
            .map_err(failed)?;

        let file = File::open(&path)
            .map_err(|e| failed(format!("cannot open {}: {}", filename, e)))?;
        let preamble = format!("DROP SCHEMA IF EXISTS {} CASCADE;\n", target.quoted());

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let reader = tokio::task::spawn_blocking(move || {
            decompress_into(Cursor::new(preamble.into_bytes()).chain(GzDecoder::new(file)), tx)
        });
        let outcome = command.run_with_input(rx).await;
        if let Err(e) = reader.await {
            warn!("Decompression of {} did not complete: {}", filename, e);
        }

        let outcome = outcome.map_err(|e| failed(e.to_string()))?;
        if !outcome.success() {
            return Err(failed(outcome.failure_message()));
        }

        info!("Restored {} from {}", target, filename);
        Ok(RestoreResult {
            schema: target.to_string(),
            filename: filename.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    pub fn delete_backup(&self, filename: &str) -> Result<()> {
        let (path, _) = self.backup_path(filename)?;
        fs::remove_file(&path)?;
        info!("Deleted backup {}", filename);
        Ok(())
    }

    /// Deletes backups created before `cutoff`. Returns how many were removed.
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        catalog::remove_older_than(&self.config.backup_dir, cutoff)
    }

    /// Applies the configured retention window.
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_older_than(catalog::retention_cutoff(self.config.retention_days)?)
    }
}

/// Gzips chunks into `file` until the sender hangs up. Runs on a blocking
/// thread; returning early closes `rx`, which aborts the producing command.
fn compress_into(file: File, mut rx: mpsc::Receiver<Vec<u8>>) -> io::Result<()> {
    let mut encoder = GzEncoder::new(file, Compression::default());
    while let Some(chunk) = rx.blocking_recv() {
        encoder.write_all(&chunk)?;
    }
    let mut file = encoder.finish()?;
    file.flush()?;
    file.sync_all()
}

/// Feeds `input` to `tx` in chunks. A read error is forwarded and ends the stream.
fn decompress_into(mut input: impl Read, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let chunk = match input.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let last = chunk.is_err();
        if tx.blocking_send(chunk).is_err() || last {
            return;
        }
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to remove partial backup {:?}: {}", path, e);
    }
}
