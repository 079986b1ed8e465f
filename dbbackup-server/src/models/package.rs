use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::TriggerOrigin;

/// Bundle container format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    TarGz,
}

text_enum!(PackageFormat {
    Zip => "zip",
    TarGz => "tar.gz",
});

impl PackageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PackageFormat::Zip => ".zip",
            PackageFormat::TarGz => ".tar.gz",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub compression: PackageFormat,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default, alias = "max_backups")]
    pub max_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Package {
    pub id: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub trigger: TriggerOrigin,
    pub created_at: DateTime<Utc>,
}

fn row_to_package(row: &Row) -> rusqlite::Result<Package> {
    Ok(Package {
        id: row.get("id")?,
        storage_path: row.get("storage_path")?,
        size_bytes: row.get("size_bytes")?,
        checksum: row.get("checksum")?,
        trigger: row.get("trigger_origin")?,
        created_at: row.get("created_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Package>> {
    let mut stmt = conn.prepare("SELECT * FROM packages ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], row_to_package)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Package>> {
    let mut stmt = conn.prepare("SELECT * FROM packages WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_package)?;
    Ok(rows.next().transpose()?)
}

pub fn create(
    conn: &Connection,
    storage_path: &str,
    size_bytes: i64,
    checksum: &str,
    trigger: TriggerOrigin,
) -> anyhow::Result<Package> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO packages (id, storage_path, size_bytes, checksum, trigger_origin, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, storage_path, size_bytes, checksum, trigger, Utc::now()],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created package"))
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM packages WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

/// Count and total size of all packages.
pub fn totals(conn: &Connection) -> anyhow::Result<(i64, i64)> {
    Ok(conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM packages",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;

    #[test]
    fn test_create_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        let first = create(&conn, "packages/a.zip", 10, "aa", TriggerOrigin::Manual).unwrap();
        create(&conn, "packages/b.zip", 32, "bb", TriggerOrigin::Scheduled).unwrap();
        assert_eq!(find_all(&conn).unwrap().len(), 2);
        assert_eq!(totals(&conn).unwrap(), (2, 42));

        assert!(delete(&conn, &first.id).unwrap());
        assert!(!delete(&conn, &first.id).unwrap());
        assert_eq!(totals(&conn).unwrap(), (1, 32));
    }

    #[test]
    fn test_upload_trigger_rejected_for_packages() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();
        assert!(create(&conn, "packages/a.zip", 1, "aa", TriggerOrigin::Upload).is_err());
    }

    #[test]
    fn test_format_serde() {
        let config: PackageConfig =
            serde_json::from_str(r#"{"compression": "tar.gz", "max_backups": 2}"#).unwrap();
        assert_eq!(config.compression, PackageFormat::TarGz);
        assert_eq!(config.max_count, Some(2));
        assert_eq!("zip".parse::<PackageFormat>().unwrap(), PackageFormat::Zip);
    }
}
