use kioscodb_gateway::api::{self, AppState};
use kioscodb_gateway::backup::BackupEngine;
use kioscodb_gateway::config::Config;
use kioscodb_gateway::pool::{ConnectionRouter, PoolManager};
use kioscodb_gateway::schema::{MigrationEngine, SchemaLifecycleManager};
use kioscodb_gateway::security::AdminAuth;
use kioscodb_gateway::tenant::{SchemaLocks, SchemaName, SchemaNamingPolicy};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment from .env file if present
    let dotenv = dotenvy::dotenv();

    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.log_dir).unwrap_or_else(|e| {
        eprintln!(
            "Warning: Could not create log directory {:?}: {}",
            config.log_dir, e
        );
    });

    // Create file appender with daily rotation
    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "kioscodb-gateway.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Console plus JSON file output
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kioscodb_gateway=debug")),
        )
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_writer(non_blocking),
        )
        .init();

    debug!("Logging initialized - log directory: {:?}", config.log_dir);
    if let Err(e) = dotenv {
        warn!("No .env file found or error loading it: {}", e);
    }

    let socket_addr = config.socket_addr()?;
    info!("Starting KioscoDB Gateway on {}", socket_addr);
    info!("Max connections: {}", config.max_connections);
    info!(
        "Shared schema: {}, tenant prefix: {}",
        config.shared_schema, config.schema_prefix
    );
    info!("Migrations directory: {:?}", config.migrations_dir);
    info!("Backup directory: {:?}", config.backup_dir);

    let auth = Arc::new(AdminAuth::from_config(&config));
    if auth.is_enabled() {
        info!("Admin API allowed from: {:?}", config.allowed_admin_ips);
    } else {
        warn!("ADMIN_TOKEN is not set; admin API is disabled");
    }

    let policy = SchemaNamingPolicy::new(&config.schema_prefix)?;
    let shared = SchemaName::parse(&config.shared_schema)?;
    let pool = Arc::new(PoolManager::new(&config).await?);
    let router = Arc::new(
        ConnectionRouter::new(pool, policy.clone(), shared)
            .with_statement_timeout(config.statement_timeout),
    );
    let locks = Arc::new(SchemaLocks::new());

    let lifecycle = Arc::new(SchemaLifecycleManager::new(
        router.clone(),
        locks.clone(),
        config.template_path.clone(),
        config.transactional_migrations,
    ));
    let migrations = Arc::new(MigrationEngine::new(
        router.clone(),
        locks.clone(),
        config.migration(),
    ));
    let backups = Arc::new(BackupEngine::new(
        config.backup(),
        router.clone(),
        policy,
        locks.clone(),
    ));

    match migrations.load_migrations() {
        Ok(set) => {
            info!(
                "Found {} migration scripts (latest version {})",
                set.scripts().len(),
                set.latest_version()
            );
            if !set.invalid().is_empty() {
                warn!("Ignoring misnamed migration files: {:?}", set.invalid());
            }
        }
        Err(e) => warn!("Migration scripts could not be loaded: {}", e),
    }

    let state = Arc::new(AppState::new(router, lifecycle, migrations, backups.clone()));
    let app = api::router(state, auth);

    // Drop lock entries for schemas nobody is working on
    let maintenance_locks = locks.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(300)); // Every 5 minutes

        loop {
            interval.tick().await;
            let removed = maintenance_locks.prune();
            if removed > 0 {
                debug!("Pruned {} idle schema locks", removed);
            }
        }
    });

    if let Some(every) = config.backup_interval {
        info!("Scheduled backups every {:?}", every);
        tokio::spawn(scheduled_backups(backups, every));
    }

    // Create listener
    let listener = tokio::net::TcpListener::bind(&socket_addr).await?;
    info!("Server listening on {}", socket_addr);

    // Run server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");

    Ok(())
}

/// Backs up every tenant, then prunes files past retention.
async fn scheduled_backups(backups: Arc<BackupEngine>, every: Duration) {
    let mut interval = interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; wait a full period instead
    interval.tick().await;

    loop {
        interval.tick().await;

        match backups.backup_all_tenants().await {
            Ok(report) => info!(
                "Scheduled backup finished: {} of {} schemas succeeded",
                report.successful, report.total
            ),
            Err(e) => error!("Scheduled backup could not run: {}", e),
        }

        match backups.cleanup_expired() {
            Ok(removed) if removed > 0 => info!("Removed {} expired backups", removed),
            Ok(_) => {}
            Err(e) => error!("Backup cleanup failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
