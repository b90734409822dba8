//! Per-tenant logical backups.

mod catalog;
mod command;
mod engine;

pub use catalog::{
    backup_filename, list_backups, parse_backup_filename, remove_older_than, retention_cutoff,
    validate_backup_filename, BackupInfo,
};
pub use command::{CommandOutcome, ExternalCommand};
pub use engine::{BackupEngine, BackupReport, BackupResult, RestoreResult};
