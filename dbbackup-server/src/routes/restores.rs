use crate::db::with_conn;
use crate::error::AppError;
use crate::models::job::{self, Job, JobFilter, JobKind, JobStatus};
use crate::models::resource;
use crate::routes::jobs::find_job;
use crate::services::dispatch;
use crate::services::pipeline::{PipelineError, RestoreSource};
use crate::state::AppState;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_restores))
        .route("/{id}", get(get_restore))
        .route("/from-job/{job_id}", post(restore_from_job))
        .route(
            "/upload/{resource_id}",
            post(restore_from_upload).layer(DefaultBodyLimit::disable()),
        )
        .route_layer(middleware::from_fn_with_state(state, restore_gate))
}

/// Every restore route is closed unless restore mode is on. Runs before
/// extractors, so a rejected upload is never read.
async fn restore_gate(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if !state.config.restore_mode {
        return AppError::from(PipelineError::RestoreDisabled).into_response();
    }
    next.run(req).await
}

async fn list_restores(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Job>>, AppError> {
    let filter = JobFilter {
        kind: Some(JobKind::Restore),
        ..Default::default()
    };
    let jobs = with_conn(&state.db, move |conn| job::list(conn, &filter)).await?;
    Ok(Json(jobs))
}

async fn get_restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = find_job(&state, &id).await?;
    if job.kind != JobKind::Restore {
        return Err(AppError::NotFound("Restore not found".into()));
    }
    Ok(Json(job))
}

#[derive(Deserialize)]
pub struct FromJobQuery {
    /// Restore into another resource instead of the one that was backed up.
    pub target_resource_id: Option<String>,
}

async fn restore_from_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Query(query): Query<FromJobQuery>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let backup = find_job(&state, &job_id).await?;
    if backup.kind != JobKind::Backup || backup.status != JobStatus::Completed {
        return Err(AppError::BadRequest("Only completed backups can be restored".into()));
    }
    let target = query.target_resource_id.unwrap_or(backup.resource_id);
    let job = dispatch::enqueue_restore(&state, &target, RestoreSource::Backup { job_id }).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn restore_from_upload(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let rid = resource_id.clone();
    let exists = with_conn(&state.db, move |conn| resource::find_by_id(conn, &rid))
        .await?
        .is_some_and(|r| !r.is_deleted());
    if !exists {
        return Err(AppError::NotFound("Resource not found".into()));
    }

    let tmp_dir = state.config.tmp_dir();
    tokio::fs::create_dir_all(&tmp_dir).await.map_err(anyhow::Error::from)?;

    let mut upload = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "upload".into());
        let (std_file, path) = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&tmp_dir)
            .map_err(anyhow::Error::from)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(std_file);
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| AppError::BadRequest(format!("Upload interrupted: {e}")))?
        {
            file.write_all(&chunk).await.map_err(anyhow::Error::from)?;
        }
        file.flush().await.map_err(anyhow::Error::from)?;
        upload = Some(RestoreSource::Upload { file: path, file_name });
        break;
    }

    let source = upload.ok_or_else(|| AppError::BadRequest("Missing 'file' field".into()))?;
    let job = dispatch::enqueue_restore(&state, &resource_id, source).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}
