use dbbackup_server::config::AppConfig;
use dbbackup_server::db::connection::{close_pool, create_pool};
use dbbackup_server::db::migrate::migrate;
use dbbackup_server::db::with_conn;
use dbbackup_server::models::job;
use dbbackup_server::services::pipeline::INTERNAL_SUMMARY;
use dbbackup_server::services::{config_sync, disk, retention, storage};
use dbbackup_server::state::AppState;
use dbbackup_server::{logging, routes};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    logging::init(&config.log_level)?;
    tracing::info!(
        port = config.port,
        restore_mode = config.restore_mode,
        workers = config.worker_pool_size,
        "Starting backup server"
    );

    // Ensure data directories exist
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.tmp_dir())?;

    // Initialize database
    let pool = create_pool(&config.db_path)?;
    migrate(&pool)?;

    // Nothing runs yet, so any running job was cut off by the last shutdown
    let interrupted = with_conn(&pool, |conn| job::fail_interrupted(conn, INTERNAL_SUMMARY)).await?;
    if interrupted > 0 {
        tracing::warn!(jobs = interrupted, "Marked interrupted jobs as failed");
    }

    let storage = storage::from_config(&config).await?;
    let state = AppState::build(pool, config.clone(), storage).await?;

    // Declarative resources. A broken document keeps what is already stored
    match config_sync::sync_from_file(&state).await {
        Ok(report) => tracing::info!(created = report.created, updated = report.updated, "Initial sync done"),
        Err(e) => tracing::warn!(error = %e, "Initial config sync failed"),
    }
    if let Err(e) = retention::refresh_package_totals(&state).await {
        tracing::warn!(error = %e, "Failed to load package metrics");
    }
    disk::refresh_metric(&config.data_dir).await;

    // Initialize cron scheduler
    state
        .scheduler
        .init_system_timers(&config.retention_cron, &config.disk_refresh_cron)
        .await?;
    if let Err(e) = state.scheduler.reload_package_schedule().await {
        tracing::warn!(error = %e, "Failed to schedule packaging");
    }
    let timers = state.scheduler.refresh().await?;
    tracing::info!(scheduled = timers.added, "Resource timers registered");
    state.scheduler.start().await?;

    // Start HTTP server
    let app = routes::create_router(state.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    if let Err(e) = state.scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    state.workers.drain().await;

    close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
