//! One-shot maintenance commands for cron jobs and operators
//!
//! Usage:
//!   kiosco-admin migrate-all
//!   kiosco-admin status
//!   kiosco-admin backup-all
//!   kiosco-admin cleanup [days]
//!   kiosco-admin list-backups [schema]
//!
//! Reads the same environment as the gateway and prints JSON on stdout.

use anyhow::Context;
use serde::Serialize;
use std::env;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kioscodb_gateway::backup::{self, BackupEngine};
use kioscodb_gateway::config::Config;
use kioscodb_gateway::pool::{ConnectionRouter, PoolManager};
use kioscodb_gateway::schema::MigrationEngine;
use kioscodb_gateway::tenant::{SchemaLocks, SchemaName, SchemaNamingPolicy};

fn usage(program: &str) {
    eprintln!("Usage: {} <command> [args]", program);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  migrate-all            Apply pending migrations to every tenant schema");
    eprintln!("  status                 Show current and latest version per tenant");
    eprintln!("  backup-all             Back up every tenant schema");
    eprintln!("  cleanup [days]         Delete backups older than days (default: retention)");
    eprintln!("  list-backups [schema]  List backup files, newest first");
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        usage(&args[0]);
        std::process::exit(1);
    };

    let _ = dotenvy::dotenv();

    // Logs on stderr so stdout stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    let policy = SchemaNamingPolicy::new(&config.schema_prefix)?;

    // Backup listing and cleanup only touch the filesystem
    match command.as_str() {
        "list-backups" => {
            let schema = args.get(2).map(String::as_str);
            return print_json(&backup::list_backups(&config.backup_dir, schema)?);
        }
        "cleanup" => return cleanup(args.get(2), &config),
        "migrate-all" | "status" | "backup-all" => {}
        other => {
            eprintln!("Unknown command: {}", other);
            usage(&args[0]);
            std::process::exit(1);
        }
    }

    let shared = SchemaName::parse(&config.shared_schema)?;
    let pool = Arc::new(
        PoolManager::new(&config)
            .await
            .context("Failed to connect to PostgreSQL")?,
    );
    let router = Arc::new(
        ConnectionRouter::new(pool, policy.clone(), shared)
            .with_statement_timeout(config.statement_timeout),
    );
    let locks = Arc::new(SchemaLocks::new());

    let failed = if command.as_str() == "backup-all" {
        let engine = BackupEngine::new(config.backup(), router, policy, locks);
        let report = engine.backup_all_tenants().await?;
        print_json(&report)?;
        report.failed
    } else {
        let engine = MigrationEngine::new(router, locks, config.migration());
        if command.as_str() == "status" {
            print_json(&engine.tenant_status().await?)?;
            0
        } else {
            let report = engine.migrate_all_tenants().await?;
            print_json(&report)?;
            report.failed
        }
    };

    if failed > 0 {
        eprintln!("{} tenant schemas failed", failed);
        std::process::exit(2);
    }
    Ok(())
}

#[derive(Serialize)]
struct CleanupSummary {
    removed: usize,
    older_than_days: i64,
}

fn cleanup(days: Option<&String>, config: &Config) -> anyhow::Result<()> {
    let days = match days {
        Some(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("Invalid number of days: {}", raw))?,
        None => config.backup_retention_days,
    };

    let cutoff = backup::retention_cutoff(days)?;
    let removed = backup::remove_older_than(&config.backup_dir, cutoff)?;
    print_json(&CleanupSummary {
        removed,
        older_than_days: days,
    })
}
