use crate::db::with_conn;
use crate::error::AppError;
use crate::models::job::{self, Job, JobFilter, JobKind, JobStatus, TriggerOrigin};
use crate::routes::download_response;
use crate::services::dispatch;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_jobs).post(trigger_backup))
        .route("/{id}", get(get_job).delete(delete_job))
        .route("/{id}/download", get(download_job))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub failed: bool,
    pub resource_id: Option<String>,
    pub kind: Option<JobKind>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>, AppError> {
    let filter = JobFilter {
        kind: query.kind,
        resource_id: query.resource_id,
        failed_only: query.failed,
    };
    let jobs = with_conn(&state.db, move |conn| job::list(conn, &filter)).await?;
    Ok(Json(jobs))
}

pub(crate) async fn find_job(state: &AppState, id: &str) -> Result<Job, AppError> {
    let jid = id.to_string();
    with_conn(&state.db, move |conn| job::find_by_id(conn, &jid))
        .await?
        .ok_or_else(|| AppError::NotFound("Job not found".into()))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(find_job(&state, &id).await?))
}

#[derive(Deserialize)]
pub struct TriggerRequest {
    pub resource_id: String,
}

/// On-demand backup. The job is returned while it runs.
async fn trigger_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let job = dispatch::enqueue_backup(&state, &body.resource_id, TriggerOrigin::Manual).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn download_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let job = find_job(&state, &id).await?;
    let path = match (&job.status, job.owns_artifact()) {
        (JobStatus::Completed, true) => job.storage_path.unwrap_or_default(),
        _ => return Err(AppError::NotFound("Job has no downloadable artifact".into())),
    };
    let download = state.storage.download(&path).await?;
    download_response(download).await
}

/// Remove the artifact, then the record. A storage failure keeps both.
async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let job = find_job(&state, &id).await?;
    if job.status == JobStatus::Running {
        return Err(AppError::Conflict("Job is still running".into()));
    }
    if let Some(path) = job.storage_path.as_deref().filter(|_| job.owns_artifact()) {
        state.storage.delete(path).await?;
    }
    with_conn(&state.db, move |conn| job::delete(conn, &id)).await?;
    tracing::info!(job_id = %job.id, "Job deleted");
    Ok(StatusCode::NO_CONTENT)
}
