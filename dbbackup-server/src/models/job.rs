use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

text_enum!(JobKind {
    Backup => "backup",
    Restore => "restore",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

text_enum!(JobStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOrigin {
    Scheduled,
    Manual,
    Upload,
}

text_enum!(TriggerOrigin {
    Scheduled => "scheduled",
    Manual => "manual",
    Upload => "upload",
});

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub resource_id: String,
    pub kind: JobKind,
    pub trigger: TriggerOrigin,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<i64>,
    pub checksum: Option<String>,
    pub storage_path: Option<String>,
    pub log: Option<String>,
    pub error_summary: Option<String>,
}

/// What a successful attempt leaves behind.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub storage_path: String,
    pub size_bytes: i64,
    pub checksum: String,
}

#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub resource_id: Option<String>,
    pub failed_only: bool,
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get("id")?,
        resource_id: row.get("resource_id")?,
        kind: row.get("kind")?,
        trigger: row.get("trigger_origin")?,
        status: row.get("status")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        size_bytes: row.get("size_bytes")?,
        checksum: row.get("checksum")?,
        storage_path: row.get("storage_path")?,
        log: row.get("log")?,
        error_summary: row.get("error_summary")?,
    })
}

pub fn create(
    conn: &Connection,
    resource_id: &str,
    kind: JobKind,
    trigger: TriggerOrigin,
) -> anyhow::Result<Job> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO jobs (id, resource_id, kind, trigger_origin, status, started_at) VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
        params![id, resource_id, kind, trigger, Utc::now()],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created job"))
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Job>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_job)?;
    Ok(rows.next().transpose()?)
}

pub fn list(conn: &Connection, filter: &JobFilter) -> anyhow::Result<Vec<Job>> {
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(kind) = filter.kind {
        clauses.push("kind = ?");
        values.push(Box::new(kind));
    }
    if let Some(ref resource_id) = filter.resource_id {
        clauses.push("resource_id = ?");
        values.push(Box::new(resource_id.clone()));
    }
    if filter.failed_only {
        clauses.push("status = 'failed'");
    }

    let mut sql = String::from("SELECT * FROM jobs");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY started_at DESC");

    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Completed backups of a resource, newest first.
pub fn completed_backups(conn: &Connection, resource_id: &str) -> anyhow::Result<Vec<Job>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE resource_id = ? AND kind = 'backup' AND status = 'completed' ORDER BY finished_at DESC",
    )?;
    let rows = stmt.query_map(params![resource_id], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn latest_completed_backup(conn: &Connection, resource_id: &str) -> anyhow::Result<Option<Job>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE resource_id = ? AND kind = 'backup' AND status = 'completed' ORDER BY finished_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![resource_id], row_to_job)?;
    Ok(rows.next().transpose()?)
}

/// Transition `running -> completed`. Returns false if the job had already left `running`.
pub fn complete(
    conn: &Connection,
    id: &str,
    artifact: &Artifact,
    log: Option<&str>,
) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE jobs SET status = 'completed', finished_at = ?1, size_bytes = ?2, checksum = ?3, storage_path = ?4, log = ?5
         WHERE id = ?6 AND status = 'running'",
        params![
            Utc::now(),
            artifact.size_bytes,
            artifact.checksum,
            artifact.storage_path,
            log.filter(|l| !l.is_empty()),
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Transition `running -> failed`. An empty log is replaced so failed jobs always carry one.
pub fn fail(conn: &Connection, id: &str, log: &str, error_summary: &str) -> anyhow::Result<bool> {
    let log = if log.trim().is_empty() {
        "job failed without producing output"
    } else {
        log
    };
    let changes = conn.execute(
        "UPDATE jobs SET status = 'failed', log = ?1, error_summary = ?2 WHERE id = ?3 AND status = 'running'",
        params![log, error_summary, id],
    )?;
    Ok(changes > 0)
}

/// Fail every job still marked running. Used at startup, when nothing
/// can be executing yet. Returns the number of jobs resolved.
pub fn fail_interrupted(conn: &Connection, error_summary: &str) -> anyhow::Result<usize> {
    let changes = conn.execute(
        "UPDATE jobs SET status = 'failed', log = ?1, error_summary = ?2 WHERE status = 'running'",
        params![INTERRUPTED_LOG, error_summary],
    )?;
    Ok(changes)
}

pub const INTERRUPTED_LOG: &str = "interrupted by server restart before the job finished";

pub fn find_by_resource(conn: &Connection, resource_id: &str) -> anyhow::Result<Vec<Job>> {
    list(
        conn,
        &JobFilter {
            resource_id: Some(resource_id.to_string()),
            ..Default::default()
        },
    )
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM jobs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

impl Job {
    /// Backups own their artifact; restores only reference their source.
    pub fn owns_artifact(&self) -> bool {
        self.kind == JobKind::Backup && self.storage_path.is_some()
    }
}
