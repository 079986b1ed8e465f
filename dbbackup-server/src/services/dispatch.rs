//! Job creation and hand-off to the worker pool.

use crate::db::with_conn;
use crate::error::AppError;
use crate::models::job::{self, Job, JobKind, JobStatus, TriggerOrigin};
use crate::models::resource;
use crate::services::disk;
use crate::services::pipeline::{self, PipelineError, RestoreSource};
use crate::services::retention;
use crate::services::workers::panic_message;
use crate::state::AppState;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

async fn create_job(
    state: &AppState,
    resource_id: &str,
    kind: JobKind,
    trigger: TriggerOrigin,
) -> Result<Job, AppError> {
    let rid = resource_id.to_string();
    let created = with_conn(&state.db, move |conn| {
        match resource::find_by_id(conn, &rid)? {
            Some(r) if !r.is_deleted() => Ok(Some(job::create(conn, &rid, kind, trigger)?)),
            _ => Ok(None),
        }
    })
    .await?;
    created.ok_or_else(|| AppError::NotFound(format!("Resource {resource_id} not found")))
}

/// Create a running backup job and queue it. Returns before the dump starts.
pub async fn enqueue_backup(
    state: &Arc<AppState>,
    resource_id: &str,
    trigger: TriggerOrigin,
) -> Result<Job, AppError> {
    let job = create_job(state, resource_id, JobKind::Backup, trigger).await?;
    tracing::info!(job_id = %job.id, resource_id = %resource_id, trigger = %trigger, "Backup queued");

    let state2 = state.clone();
    let (jid, rid) = (job.id.clone(), resource_id.to_string());
    state.workers.spawn(async move {
        execute_backup(&state2, &jid, &rid).await;
    });
    Ok(job)
}

/// Create a running restore job and queue it.
pub async fn enqueue_restore(
    state: &Arc<AppState>,
    resource_id: &str,
    source: RestoreSource,
) -> Result<Job, AppError> {
    if !state.config.restore_mode {
        return Err(PipelineError::RestoreDisabled.into());
    }
    let trigger = match source {
        RestoreSource::Upload { .. } => TriggerOrigin::Upload,
        RestoreSource::Backup { .. } => TriggerOrigin::Manual,
    };
    let job = create_job(state, resource_id, JobKind::Restore, trigger).await?;
    tracing::info!(job_id = %job.id, resource_id = %resource_id, "Restore queued");

    let state2 = state.clone();
    let (jid, rid) = (job.id.clone(), resource_id.to_string());
    state.workers.spawn(async move {
        execute_restore(&state2, &jid, &rid, source).await;
    });
    Ok(job)
}

/// Run a backup job to completion, then chain retention and disk metrics.
/// Never returns an error; every outcome ends up on the job record or the log.
pub async fn execute_backup(state: &AppState, job_id: &str, resource_id: &str) -> Option<Job> {
    let outcome = AssertUnwindSafe(pipeline::run_backup(state, job_id, resource_id))
        .catch_unwind()
        .await;
    let job = settle(state, job_id, outcome).await?;

    if job.status == JobStatus::Completed {
        match retention::enforce(state, Some(resource_id)).await {
            Ok(report) if !report.failures.is_empty() => {
                tracing::warn!(resource_id = %resource_id, failures = report.failures.len(), "Retention finished with failures")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(resource_id = %resource_id, error = %e, "Retention failed"),
        }
        disk::refresh_metric(&state.config.data_dir).await;
    }
    Some(job)
}

pub async fn execute_restore(
    state: &AppState,
    job_id: &str,
    resource_id: &str,
    source: RestoreSource,
) -> Option<Job> {
    let outcome = AssertUnwindSafe(pipeline::run_restore(state, job_id, resource_id, source))
        .catch_unwind()
        .await;
    settle(state, job_id, outcome).await
}

async fn settle(
    state: &AppState,
    job_id: &str,
    outcome: std::thread::Result<Result<Job, PipelineError>>,
) -> Option<Job> {
    let log = match outcome {
        Ok(Ok(job)) => return Some(job),
        Ok(Err(PipelineError::NotFound(what))) => {
            tracing::warn!(job_id = %job_id, "Pipeline skipped: {what}");
            return None;
        }
        Ok(Err(PipelineError::NotRunning(_))) => {
            tracing::warn!(job_id = %job_id, "Pipeline skipped: job already concluded");
            return None;
        }
        Ok(Err(e)) => format!("{e:#}"),
        Err(panic) => format!("pipeline panicked: {}", panic_message(&panic)),
    };

    tracing::error!(job_id = %job_id, error = %log, "Pipeline aborted");
    if let Err(e) = pipeline::fail_job(state, job_id, &log).await {
        tracing::error!(job_id = %job_id, error = %e, "Failed to mark job failed");
    }
    None
}

/// Body of a per-resource timer firing.
pub async fn run_scheduled_backup(state: &AppState, resource_id: &str) {
    let rid = resource_id.to_string();
    let created = with_conn(&state.db, move |conn| match resource::find_by_id(conn, &rid)? {
        Some(r) if r.active_schedule().is_some() => {
            Ok(Some(job::create(conn, &rid, JobKind::Backup, TriggerOrigin::Scheduled)?))
        }
        _ => Ok(None),
    })
    .await;

    let job = match created {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::warn!(resource_id = %resource_id, "Timer fired for a resource that is gone or unscheduled");
            return;
        }
        Err(e) => {
            tracing::error!(resource_id = %resource_id, error = %e, "Failed to create scheduled job");
            return;
        }
    };

    tracing::info!(job_id = %job.id, resource_id = %resource_id, "Starting scheduled backup");
    execute_backup(state, &job.id, resource_id).await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::resource::Compression;
    use crate::test_support::{create_resource, TestEnv};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_backup_returns_running_job() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "sleep 0.2; printf dump");
        let resource = create_resource(&env.state, "Main DB", Compression::None).await;

        let job = enqueue_backup(&env.state, &resource.id, TriggerOrigin::Manual).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);

        env.state.workers.drain().await;
        assert_eq!(env.job(&job.id).await.status, JobStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_for_unknown_resource_is_not_found() {
        let env = TestEnv::new(false).await;
        let err = enqueue_backup(&env.state, "nope", TriggerOrigin::Manual).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restore_disabled_creates_no_job() {
        let env = TestEnv::new(false).await;
        let resource = create_resource(&env.state, "Main DB", Compression::None).await;
        let err = enqueue_restore(&env.state, &resource.id, RestoreSource::Backup { job_id: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let rid = resource.id.clone();
        let jobs = with_conn(&env.state.db, move |conn| job::find_by_resource(conn, &rid)).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restore_of_missing_backup_marks_job_failed() {
        let env = TestEnv::new(true).await;
        let resource = create_resource(&env.state, "Main DB", Compression::None).await;
        let job = enqueue_restore(&env.state, &resource.id, RestoreSource::Backup { job_id: "missing".into() })
            .await
            .unwrap();
        env.state.workers.drain().await;

        let failed = env.job(&job.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.log.unwrap().contains("no completed artifact"));
    }
}
