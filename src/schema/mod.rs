mod lifecycle;
mod migration;
mod script;

pub use lifecycle::SchemaLifecycleManager;
pub use migration::{
    MigrationEngine, MigrationReport, TenantMigrationResult, TenantVersionStatus, LEDGER_TABLE,
};
pub use script::{
    compute_checksum, parse_migration_filename, split_statements, MigrationScript, MigrationSet,
};
