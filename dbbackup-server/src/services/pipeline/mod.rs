//! One backup or restore attempt for one job record.
//!
//! Failures of the external tool are recorded on the job and never returned
//! as errors; only a missing job/resource or a closed safety gate is.

pub mod classify;
pub mod command;
pub mod stream;

use crate::db::with_conn;
use crate::metrics;
use crate::models::job::{self, Artifact, Job, JobKind, JobStatus, TriggerOrigin};
use crate::models::resource::{self, Compression, Resource};
use crate::state::AppState;
use crate::utils::timestamp_slug;
use anyhow::Context;
use classify::classify;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    NotFound(String),

    #[error("job {0} is not running")]
    NotRunning(String),

    #[error("restore mode is disabled")]
    RestoreDisabled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Where a restore reads its artifact from.
pub enum RestoreSource {
    /// The artifact of a completed backup job.
    Backup { job_id: String },
    /// A file uploaded by an operator, removed when the restore finishes.
    Upload {
        file: tempfile::TempPath,
        file_name: String,
    },
}

enum Attempt {
    Completed {
        artifact: Artifact,
        log: Option<String>,
    },
    Failed {
        log: String,
        summary: String,
    },
}

pub const INTERNAL_SUMMARY: &str = "Internal error: the job could not be executed, see the full log";
const EMPTY_SUMMARY: &str = "Empty artifact: the dump tool produced no output";

/// `backups/{resource}-{id prefix}/{engine}_{timestamp}[_manual]{ext}`
pub fn artifact_path(resource: &Resource, job: &Job) -> String {
    let manual = if job.trigger == TriggerOrigin::Manual { "_manual" } else { "" };
    format!(
        "backups/{}/{}_{}{}{}{}",
        resource.storage_dir(),
        resource.engine.as_str(),
        timestamp_slug(job.started_at),
        manual,
        resource.engine.extension(),
        resource.compression.suffix(),
    )
}

pub async fn run_backup(state: &AppState, job_id: &str, resource_id: &str) -> Result<Job, PipelineError> {
    let (job, resource) = load(state, job_id, resource_id, JobKind::Backup).await?;
    let _lock = state.locks.acquire(&resource.id).await;

    tracing::info!(job_id = %job.id, resource = %resource.name, engine = %resource.engine, "Starting backup");
    let started = Instant::now();
    let attempt = backup_attempt(state, &job, &resource).await;
    let job = conclude(state, &job, attempt).await?;
    metrics::record_job(&resource, &job, started.elapsed());
    Ok(job)
}

pub async fn run_restore(
    state: &AppState,
    job_id: &str,
    resource_id: &str,
    source: RestoreSource,
) -> Result<Job, PipelineError> {
    if !state.config.restore_mode {
        return Err(PipelineError::RestoreDisabled);
    }
    let (job, resource) = load(state, job_id, resource_id, JobKind::Restore).await?;
    let _lock = state.locks.acquire(&resource.id).await;

    tracing::info!(job_id = %job.id, resource = %resource.name, engine = %resource.engine, "Starting restore");
    let started = Instant::now();
    let attempt = restore_attempt(state, &resource, source).await;
    let job = conclude(state, &job, attempt).await?;
    metrics::record_job(&resource, &job, started.elapsed());
    Ok(job)
}

async fn load(
    state: &AppState,
    job_id: &str,
    resource_id: &str,
    kind: JobKind,
) -> Result<(Job, Resource), PipelineError> {
    let (jid, rid) = (job_id.to_string(), resource_id.to_string());
    let (job, resource) = with_conn(&state.db, move |conn| {
        Ok((job::find_by_id(conn, &jid)?, resource::find_by_id(conn, &rid)?))
    })
    .await?;

    let job = job.ok_or_else(|| PipelineError::NotFound(format!("Job {job_id} not found")))?;
    let resource =
        resource.ok_or_else(|| PipelineError::NotFound(format!("Resource {resource_id} not found")))?;
    if job.status != JobStatus::Running {
        return Err(PipelineError::NotRunning(job.id));
    }
    if job.kind != kind {
        return Err(anyhow::anyhow!("Job {} is a {}, not a {}", job.id, job.kind, kind).into());
    }
    Ok((job, resource))
}

async fn backup_attempt(state: &AppState, job: &Job, resource: &Resource) -> anyhow::Result<Attempt> {
    let tmp_dir = state.config.tmp_dir();
    tokio::fs::create_dir_all(&tmp_dir).await?;
    // Removed on drop, whichever way this function returns
    let (file, staged) = tempfile::Builder::new()
        .prefix("dump-")
        .tempfile_in(&tmp_dir)?
        .into_parts();

    let dump = command::dump_command(resource, &state.config.tools);
    let captured = stream::capture(dump, tokio::fs::File::from_std(file), resource.compression).await?;

    if let Some(log) = captured.failure_log(true) {
        let summary = classify(&log).summary().to_string();
        return Ok(Attempt::Failed { log, summary });
    }
    if captured.bytes == 0 {
        return Ok(Attempt::Failed {
            log: format!("{} exited successfully but produced no output", captured.program),
            summary: EMPTY_SUMMARY.into(),
        });
    }

    let (size, checksum) = stream::digest_file(&staged).await?;
    let dest = artifact_path(resource, job);
    state.storage.save(&staged, &dest).await?;

    Ok(Attempt::Completed {
        artifact: Artifact {
            storage_path: dest,
            size_bytes: size as i64,
            checksum,
        },
        log: None,
    })
}

async fn restore_attempt(
    state: &AppState,
    resource: &Resource,
    source: RestoreSource,
) -> anyhow::Result<Attempt> {
    let tmp_dir = state.config.tmp_dir();
    tokio::fs::create_dir_all(&tmp_dir).await?;

    let (label, local, compression) = match source {
        RestoreSource::Backup { job_id } => {
            let jid = job_id.clone();
            let backup = with_conn(&state.db, move |conn| job::find_by_id(conn, &jid))
                .await?
                .filter(|j| j.kind == JobKind::Backup && j.status == JobStatus::Completed)
                .with_context(|| format!("Backup job {job_id} has no completed artifact"))?;
            let path = backup
                .storage_path
                .with_context(|| format!("Backup job {job_id} has no storage path"))?;

            let staged = tempfile::Builder::new()
                .prefix("restore-")
                .tempfile_in(&tmp_dir)?
                .into_temp_path();
            state.storage.fetch_to_local(&path, &staged).await?;
            let compression = Compression::from_path(&path);
            (path, staged, compression)
        }
        RestoreSource::Upload { file, file_name } => {
            let compression = Compression::from_path(&file_name);
            (format!("upload:{file_name}"), file, compression)
        }
    };

    let (size, checksum) = stream::digest_file(&local).await?;
    let restore = command::restore_command(resource, &state.config.tools);
    let captured = stream::feed(restore, &local, compression).await?;

    // Restore tools log progress on stderr, so only the exit status decides
    if let Some(log) = captured.failure_log(false) {
        let summary = classify(&log).summary().to_string();
        return Ok(Attempt::Failed { log, summary });
    }

    Ok(Attempt::Completed {
        artifact: Artifact {
            storage_path: label,
            size_bytes: size as i64,
            checksum,
        },
        log: Some(captured.stderr),
    })
}

/// Persist the terminal status of an attempt and return the updated job.
async fn conclude(
    state: &AppState,
    job: &Job,
    attempt: anyhow::Result<Attempt>,
) -> Result<Job, PipelineError> {
    let attempt = attempt.unwrap_or_else(|e| Attempt::Failed {
        log: format!("{e:#}"),
        summary: INTERNAL_SUMMARY.into(),
    });

    match &attempt {
        Attempt::Completed { artifact, .. } => tracing::info!(
            job_id = %job.id,
            path = %artifact.storage_path,
            size = artifact.size_bytes,
            "{} completed", job.kind
        ),
        Attempt::Failed { summary, .. } => tracing::warn!(
            job_id = %job.id,
            summary = %summary,
            "{} failed", job.kind
        ),
    }

    let id = job.id.clone();
    let updated = with_conn(&state.db, move |conn| {
        let changed = match &attempt {
            Attempt::Completed { artifact, log } => job::complete(conn, &id, artifact, log.as_deref())?,
            Attempt::Failed { log, summary } => job::fail(conn, &id, log, summary)?,
        };
        if !changed {
            tracing::warn!(job_id = %id, "Job left running state before it concluded");
        }
        job::find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Job {id} disappeared"))
    })
    .await?;
    Ok(updated)
}

/// Mark a job failed from outside the pipeline, e.g. after a panic.
pub async fn fail_job(state: &AppState, job_id: &str, log: &str) -> anyhow::Result<()> {
    let (id, log) = (job_id.to_string(), log.to_string());
    with_conn(&state.db, move |conn| {
        job::fail(conn, &id, &log, INTERNAL_SUMMARY)?;
        Ok(())
    })
    .await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::resource::EngineKind;
    use crate::test_support::{create_resource, create_job, TestEnv};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_successful_backup_completes_with_artifact() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "printf 'PGDMP-archive-bytes'");
        let resource = create_resource(&env.state, "Main DB", Compression::Gzip).await;
        let job = create_job(&env.state, &resource.id, JobKind::Backup, TriggerOrigin::Manual).await;

        let done = run_backup(&env.state, &job.id, &resource.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        let path = done.storage_path.clone().unwrap();
        assert!(path.starts_with(&format!("backups/main-db-{}/postgres_", &resource.id[..8])));
        assert!(path.ends_with("_manual.dump.gz"));
        assert!(done.finished_at.is_some());
        assert_eq!(done.checksum.as_ref().map(String::len), Some(64));
        let stored = env.storage_root().join(&path);
        assert_eq!(std::fs::metadata(stored).unwrap().len() as i64, done.size_bytes.unwrap());
        assert!(env.tmp_is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_dump_records_raw_stderr_and_summary() {
        let env = TestEnv::new(false).await;
        env.tool(
            "pg_dump",
            "echo 'pg_dump: error: FATAL:  password authentication failed for user \"backup\"' >&2; exit 1",
        );
        let resource = create_resource(&env.state, "Main DB", Compression::None).await;
        let job = create_job(&env.state, &resource.id, JobKind::Backup, TriggerOrigin::Scheduled).await;

        let failed = run_backup(&env.state, &job.id, &resource.id).await.unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.log.unwrap().contains("password authentication failed"));
        assert_eq!(
            failed.error_summary.as_deref(),
            Some(classify::FailureKind::Authentication.summary())
        );
        assert!(failed.storage_path.is_none());
        assert!(failed.finished_at.is_none());
        assert!(env.tmp_is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stderr_with_zero_exit_still_fails() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "echo 'warning: something odd' >&2; printf data");
        let resource = create_resource(&env.state, "Main DB", Compression::None).await;
        let job = create_job(&env.state, &resource.id, JobKind::Backup, TriggerOrigin::Manual).await;

        let failed = run_backup(&env.state, &job.id, &resource.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.log.as_deref().map(str::trim), Some("warning: something odd"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_dump_fails() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "exit 0");
        let resource = create_resource(&env.state, "Main DB", Compression::Zstd).await;
        let job = create_job(&env.state, &resource.id, JobKind::Backup, TriggerOrigin::Manual).await;

        let failed = run_backup(&env.state, &job.id, &resource.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_summary.as_deref(), Some(EMPTY_SUMMARY));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_tool_marks_job_failed() {
        let env = TestEnv::new(false).await;
        let resource = create_resource(&env.state, "Main DB", Compression::None).await;
        let job = create_job(&env.state, &resource.id, JobKind::Backup, TriggerOrigin::Manual).await;

        let failed = run_backup(&env.state, &job.id, &resource.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.log.unwrap().contains("Failed to spawn"));
        assert_eq!(failed.error_summary.as_deref(), Some(INTERNAL_SUMMARY));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_records_fail_fast_without_mutation() {
        let env = TestEnv::new(false).await;
        let resource = create_resource(&env.state, "Main DB", Compression::None).await;
        let job = create_job(&env.state, &resource.id, JobKind::Backup, TriggerOrigin::Manual).await;

        let err = run_backup(&env.state, "missing-job", &resource.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
        let err = run_backup(&env.state, &job.id, "missing-resource").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));

        let untouched = env.job(&job.id).await;
        assert_eq!(untouched.status, JobStatus::Running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restore_gate_blocks_before_loading() {
        let env = TestEnv::new(false).await;
        let resource = create_resource(&env.state, "Main DB", Compression::None).await;
        let job = create_job(&env.state, &resource.id, JobKind::Restore, TriggerOrigin::Manual).await;

        let err = run_restore(
            &env.state,
            &job.id,
            &resource.id,
            RestoreSource::Backup { job_id: "any".into() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::RestoreDisabled));
        assert_eq!(env.job(&job.id).await.status, JobStatus::Running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restore_from_backup_pipes_decompressed_artifact() {
        let env = TestEnv::new(true).await;
        env.tool("pg_dump", "printf 'full database dump'");
        let received = env.dir.path().join("received.bin");
        env.tool("pg_restore", &format!("echo 'pg_restore: processing' >&2; cat > '{}'", received.display()));

        let resource = create_resource(&env.state, "Main DB", Compression::Zstd).await;
        let backup = create_job(&env.state, &resource.id, JobKind::Backup, TriggerOrigin::Manual).await;
        let backup = run_backup(&env.state, &backup.id, &resource.id).await.unwrap();
        assert_eq!(backup.status, JobStatus::Completed);

        let restore = create_job(&env.state, &resource.id, JobKind::Restore, TriggerOrigin::Manual).await;
        let done = run_restore(
            &env.state,
            &restore.id,
            &resource.id,
            RestoreSource::Backup { job_id: backup.id.clone() },
        )
        .await
        .unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.storage_path, backup.storage_path);
        assert_eq!(done.checksum, backup.checksum);
        assert_eq!(std::fs::read_to_string(received).unwrap(), "full database dump");
        assert!(done.log.unwrap().contains("processing"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restore_nonzero_exit_fails() {
        let env = TestEnv::new(true).await;
        env.tool("mysql", "cat > /dev/null; echo \"ERROR 1049 (42000): Unknown database 'shop'\" >&2; exit 1");
        let mut resource = create_resource(&env.state, "Shop", Compression::None).await;
        resource = env.set_engine(&resource.id, EngineKind::MySql).await;

        let upload = env.dir.path().join("upload.sql");
        std::fs::write(&upload, "create table t (id int);").unwrap();
        let job = create_job(&env.state, &resource.id, JobKind::Restore, TriggerOrigin::Upload).await;
        let failed = run_restore(
            &env.state,
            &job.id,
            &resource.id,
            RestoreSource::Upload {
                file: tempfile::TempPath::from_path(&upload),
                file_name: "upload.sql".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.error_summary.as_deref(),
            Some(classify::FailureKind::MissingDatabase.summary())
        );
        assert!(!upload.exists());
    }

    #[test]
    fn test_artifact_path_format() {
        use chrono::TimeZone;
        let at = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        let resource = Resource {
            id: "r".into(),
            name: "Billing Prod".into(),
            engine: EngineKind::MongoDb,
            host: "h".into(),
            port: 27017,
            username: "u".into(),
            password: "p".into(),
            database_name: "d".into(),
            schedule: None,
            compression: Compression::None,
            retention_days: None,
            max_count: None,
            include_in_package: false,
            provenance: resource::Provenance::ApiManaged,
            created_at: at,
            updated_at: at,
        };
        let job = Job {
            id: "j".into(),
            resource_id: "r".into(),
            kind: JobKind::Backup,
            trigger: TriggerOrigin::Scheduled,
            status: JobStatus::Running,
            started_at: at,
            finished_at: None,
            size_bytes: None,
            checksum: None,
            storage_path: None,
            log: None,
            error_summary: None,
        };
        assert_eq!(
            artifact_path(&resource, &job),
            "backups/billing-prod-r/mongodb_2024-05-01_02-00-00.archive"
        );
    }
}
