use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  engine TEXT NOT NULL CHECK(engine IN ('postgres','mysql','mongodb')),
  host TEXT NOT NULL,
  port INTEGER NOT NULL,
  username TEXT NOT NULL,
  password TEXT NOT NULL,
  database_name TEXT NOT NULL,
  schedule TEXT,
  compression TEXT NOT NULL DEFAULT 'none' CHECK(compression IN ('none','gzip','zstd')),
  retention_days INTEGER,
  max_count INTEGER,
  include_in_package INTEGER NOT NULL DEFAULT 0,
  config_id TEXT UNIQUE,
  overridden INTEGER NOT NULL DEFAULT 0,
  deleted INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK(config_id IS NOT NULL OR (overridden = 0 AND deleted = 0))
);

CREATE TABLE IF NOT EXISTS jobs (
  id TEXT PRIMARY KEY,
  resource_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK(kind IN ('backup','restore')),
  trigger_origin TEXT NOT NULL CHECK(trigger_origin IN ('scheduled','manual','upload')),
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running','completed','failed')),
  started_at TEXT NOT NULL,
  finished_at TEXT,
  size_bytes INTEGER,
  checksum TEXT,
  storage_path TEXT,
  log TEXT,
  error_summary TEXT,
  CHECK((status = 'completed') = (finished_at IS NOT NULL AND size_bytes IS NOT NULL AND checksum IS NOT NULL AND storage_path IS NOT NULL)),
  CHECK(status <> 'failed' OR (log IS NOT NULL AND log <> ''))
);

CREATE TABLE IF NOT EXISTS packages (
  id TEXT PRIMARY KEY,
  storage_path TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  checksum TEXT NOT NULL,
  trigger_origin TEXT NOT NULL CHECK(trigger_origin IN ('scheduled','manual')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_resource ON jobs(resource_id, kind, status);
CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs(finished_at DESC);
CREATE INDEX IF NOT EXISTS idx_packages_created ON packages(created_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Applying schema...");
    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;
    tracing::info!("[DB] Schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;

    #[test]
    fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('resources','jobs','packages','settings')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_completed_job_requires_artifact_columns() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        let bare = conn.execute(
            "INSERT INTO jobs (id, resource_id, kind, trigger_origin, status, started_at) VALUES ('j1', 'r1', 'backup', 'manual', 'completed', '2024-01-01')",
            [],
        );
        assert!(bare.is_err());

        let failed_without_log = conn.execute(
            "INSERT INTO jobs (id, resource_id, kind, trigger_origin, status, started_at) VALUES ('j2', 'r1', 'backup', 'manual', 'failed', '2024-01-01')",
            [],
        );
        assert!(failed_without_log.is_err());
    }

    #[test]
    fn test_api_managed_resource_cannot_be_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        let res = conn.execute(
            "INSERT INTO resources (id, name, engine, host, port, username, password, database_name, deleted, created_at, updated_at)
             VALUES ('r1', 'n', 'postgres', 'h', 5432, 'u', 'p', 'd', 1, 'now', 'now')",
            [],
        );
        assert!(res.is_err());
    }
}
