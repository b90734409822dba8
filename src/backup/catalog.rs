//! Backup file naming. The backup directory is the catalog: every file named
//! `{schema}_{YYYYMMDD_HHMMSS}.sql.gz` is a backup, anything else is ignored.

use crate::error::{GatewayError, Result};
use crate::tenant::SchemaName;
use chrono::{DateTime, NaiveDateTime, TimeDelta, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    pub schema: String,
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

fn backup_filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z_][a-z0-9_]*)_(\d{8}_\d{6})\.sql\.gz$").unwrap())
}

pub fn backup_filename(schema: &SchemaName, at: DateTime<Utc>) -> String {
    format!("{}_{}.sql.gz", schema, at.format(TIMESTAMP_FORMAT))
}

/// Schema and creation time encoded in a backup filename.
pub fn parse_backup_filename(filename: &str) -> Option<(String, DateTime<Utc>)> {
    let caps = backup_filename_re().captures(filename)?;
    let naive = NaiveDateTime::parse_from_str(&caps[2], TIMESTAMP_FORMAT).ok()?;
    Some((caps[1].to_string(), Utc.from_utc_datetime(&naive)))
}

/// Rejects anything that could escape the backup directory or is not a
/// backup name.
pub fn validate_backup_filename(filename: &str) -> Result<(String, DateTime<Utc>)> {
    let invalid = |reason: &str| GatewayError::InvalidBackupFilename {
        filename: filename.to_string(),
        reason: reason.to_string(),
    };

    if filename.contains('/') || filename.contains('\\') || filename.contains('\0') {
        return Err(invalid("path separators are not allowed"));
    }
    if filename.contains("..") {
        return Err(invalid("parent directory references are not allowed"));
    }
    parse_backup_filename(filename)
        .ok_or_else(|| invalid("expected {schema}_{YYYYMMDD_HHMMSS}.sql.gz"))
}

/// Backups in `dir`, newest first, optionally only those of `schema`.
pub fn list_backups(dir: &Path, schema: Option<&str>) -> Result<Vec<BackupInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().to_string();

        let Some((backup_schema, created_at)) = parse_backup_filename(&filename) else {
            debug!("Skipping {} in backup directory", filename);
            continue;
        };
        if schema.map_or(false, |s| s != backup_schema) {
            continue;
        }

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        backups.push(BackupInfo {
            schema: backup_schema,
            filename,
            size_bytes: metadata.len(),
            created_at,
        });
    }

    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    Ok(backups)
}

/// The instant `days` days before now, for retention sweeps.
///
/// Negative or out-of-range day counts are rejected rather than wrapped.
pub fn retention_cutoff(days: i64) -> Result<DateTime<Utc>> {
    let invalid = |reason: &str| GatewayError::InvalidRequest {
        message: format!("older_than_days {} {}", days, reason),
    };

    if days < 0 {
        return Err(invalid("must not be negative"));
    }
    TimeDelta::try_days(days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or_else(|| invalid("is out of range"))
}

/// Deletes backups in `dir` created before `cutoff`. Returns how many were
/// removed; a file that cannot be removed is logged and skipped.
pub fn remove_older_than(dir: &Path, cutoff: DateTime<Utc>) -> Result<usize> {
    let mut removed = 0;
    for backup in list_backups(dir, None)? {
        if backup.created_at >= cutoff {
            continue;
        }
        match fs::remove_file(dir.join(&backup.filename)) {
            Ok(()) => {
                debug!("Removed expired backup {}", backup.filename);
                removed += 1;
            }
            Err(e) => warn!("Failed to remove expired backup {}: {}", backup.filename, e),
        }
    }
    if removed > 0 {
        info!("Removed {} backups older than {}", removed, cutoff);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_filename_format_and_parse() {
        let schema = SchemaName::parse("tenant_abc_01").unwrap();
        let name = backup_filename(&schema, at(2026, 3, 9, 7, 5, 1));
        assert_eq!(name, "tenant_abc_01_20260309_070501.sql.gz");

        let (parsed_schema, created) = parse_backup_filename(&name).unwrap();
        assert_eq!(parsed_schema, "tenant_abc_01");
        assert_eq!(created, at(2026, 3, 9, 7, 5, 1));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(parse_backup_filename("notes.txt").is_none());
        assert!(parse_backup_filename("tenant_a_20260309.sql.gz").is_none());
        assert!(parse_backup_filename("tenant_a_20261399_000000.sql.gz").is_none());
        assert!(parse_backup_filename("Tenant_a_20260309_070501.sql.gz").is_none());
    }

    #[test]
    fn test_validate_rejects_traversal() {
        for name in [
            "../tenant_a_20260309_070501.sql.gz",
            "sub/tenant_a_20260309_070501.sql.gz",
            "sub\\tenant_a_20260309_070501.sql.gz",
            "tenant_a..b_20260309_070501.sql.gz",
            "tenant_a.sql.gz",
        ] {
            assert!(
                matches!(
                    validate_backup_filename(name),
                    Err(GatewayError::InvalidBackupFilename { .. })
                ),
                "{} should be rejected",
                name
            );
        }
        assert!(validate_backup_filename("tenant_a_20260309_070501.sql.gz").is_ok());
    }

    #[test]
    fn test_list_sorts_newest_first_and_filters() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tenant_a_20260101_000000.sql.gz"), b"a1").unwrap();
        fs::write(dir.path().join("tenant_a_20260301_000000.sql.gz"), b"a22").unwrap();
        fs::write(dir.path().join("tenant_b_20260201_000000.sql.gz"), b"b").unwrap();
        fs::write(dir.path().join("README"), b"ignore").unwrap();

        let all = list_backups(dir.path(), None).unwrap();
        let names: Vec<&str> = all.iter().map(|b| b.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "tenant_a_20260301_000000.sql.gz",
                "tenant_b_20260201_000000.sql.gz",
                "tenant_a_20260101_000000.sql.gz",
            ]
        );
        assert_eq!(all[0].size_bytes, 3);

        let only_a = list_backups(dir.path(), Some("tenant_a")).unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|b| b.schema == "tenant_a"));
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        assert!(list_backups(Path::new("/nonexistent/backups"), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_remove_older_than_keeps_recent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tenant_a_20250101_000000.sql.gz"), b"old").unwrap();
        fs::write(dir.path().join("tenant_a_20260301_000000.sql.gz"), b"new").unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        let removed = remove_older_than(dir.path(), at(2026, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("tenant_a_20250101_000000.sql.gz").exists());
        assert!(dir.path().join("tenant_a_20260301_000000.sql.gz").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_retention_cutoff_rejects_out_of_range_days() {
        let cutoff = retention_cutoff(30).unwrap();
        let expected = Utc::now() - TimeDelta::days(30);
        assert!((expected - cutoff).num_seconds().abs() < 5);

        assert!(retention_cutoff(0).is_ok());
        for days in [-1, 100_000_000, i64::MAX] {
            assert!(
                matches!(
                    retention_cutoff(days),
                    Err(GatewayError::InvalidRequest { .. })
                ),
                "{} days should be rejected",
                days
            );
        }
    }
}
