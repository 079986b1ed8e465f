use crate::error::AppError;
use crate::services::backup_scheduler::ReconcileReport;
use crate::services::config_sync::{self, SyncReport};
use crate::state::AppState;
use axum::extract::State;
use axum::routing::{post, put};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reload-resources", post(reload_resources))
        .route("/config", put(replace_config))
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub sync: SyncReport,
    pub timers: ReconcileReport,
    pub package_schedule: Option<String>,
}

async fn reconcile(state: &AppState, sync: SyncReport) -> Result<Json<ReloadResponse>, AppError> {
    let timers = state.scheduler.refresh().await?;
    let package_schedule = state.scheduler.reload_package_schedule().await?;
    Ok(Json(ReloadResponse {
        sync,
        timers,
        package_schedule,
    }))
}

/// Re-read the declarative document and bring timers in line with it.
async fn reload_resources(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, AppError> {
    let sync = config_sync::sync_from_file(&state).await?;
    reconcile(&state, sync).await
}

/// Replace the document with the YAML body. Declared resources it no longer
/// mentions are removed.
async fn replace_config(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<ReloadResponse>, AppError> {
    let sync = config_sync::replace_document(&state, &body).await?;
    reconcile(&state, sync).await
}
