use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::utils::sanitize_filename;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    MySql,
    MongoDb,
}

text_enum!(EngineKind {
    Postgres => "postgres",
    MySql => "mysql",
    MongoDb => "mongodb",
});

impl EngineKind {
    /// Base file extension of a dump produced by this engine's tool.
    pub fn extension(&self) -> &'static str {
        match self {
            EngineKind::Postgres => ".dump",
            EngineKind::MySql => ".sql",
            EngineKind::MongoDb => ".archive",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            EngineKind::Postgres => 5432,
            EngineKind::MySql => 3306,
            EngineKind::MongoDb => 27017,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

text_enum!(Compression {
    None => "none",
    Gzip => "gzip",
    Zstd => "zstd",
});

impl Compression {
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }

    /// Infer the compression of an artifact from its file name.
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".gz") {
            Compression::Gzip
        } else if lower.ends_with(".zst") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Where a resource definition came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    ApiManaged,
    Declared {
        config_id: String,
        /// Edited through the API; config reloads leave it alone.
        overridden: bool,
        /// Soft-deleted through the API until reset.
        deleted: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database_name: String,
    pub schedule: Option<String>,
    pub compression: Compression,
    pub retention_days: Option<u32>,
    pub max_count: Option<u32>,
    pub include_in_package: bool,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn slug(&self) -> String {
        sanitize_filename(&self.name)
    }

    /// Storage directory for this resource's artifacts. Names that slug the
    /// same still get distinct directories through the id prefix.
    pub fn storage_dir(&self) -> String {
        let short: String = self.id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
        format!("{}-{}", self.slug(), short)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.provenance, Provenance::Declared { deleted: true, .. })
    }

    pub fn config_id(&self) -> Option<&str> {
        match &self.provenance {
            Provenance::Declared { config_id, .. } => Some(config_id),
            Provenance::ApiManaged => None,
        }
    }

    pub fn active_schedule(&self) -> Option<&str> {
        if self.is_deleted() {
            return None;
        }
        self.schedule.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateResourceRequest {
    pub name: String,
    pub engine: EngineKind,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub database_name: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub max_count: Option<u32>,
    #[serde(default)]
    pub include_in_package: bool,
}

impl CreateResourceRequest {
    fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }
}

/// Partial update. Nullable fields use `Some(None)` to clear.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateResourceRequest {
    pub name: Option<String>,
    pub engine: Option<EngineKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database_name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub schedule: Option<Option<String>>,
    pub compression: Option<Compression>,
    #[serde(default, deserialize_with = "nullable")]
    pub retention_days: Option<Option<u32>>,
    #[serde(default, deserialize_with = "nullable")]
    pub max_count: Option<Option<u32>>,
    pub include_in_package: Option<bool>,
}

fn nullable<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

fn row_to_resource(row: &Row) -> rusqlite::Result<Resource> {
    let config_id: Option<String> = row.get("config_id")?;
    let provenance = match config_id {
        Some(config_id) => Provenance::Declared {
            config_id,
            overridden: row.get("overridden")?,
            deleted: row.get("deleted")?,
        },
        None => Provenance::ApiManaged,
    };
    Ok(Resource {
        id: row.get("id")?,
        name: row.get("name")?,
        engine: row.get("engine")?,
        host: row.get("host")?,
        port: row.get("port")?,
        username: row.get("username")?,
        password: row.get("password")?,
        database_name: row.get("database_name")?,
        schedule: row.get("schedule")?,
        compression: row.get("compression")?,
        retention_days: row.get("retention_days")?,
        max_count: row.get("max_count")?,
        include_in_package: row.get("include_in_package")?,
        provenance,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// All resources visible to listings and scheduling.
pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Resource>> {
    let mut stmt = conn.prepare("SELECT * FROM resources WHERE deleted = 0 ORDER BY created_at")?;
    let rows = stmt.query_map([], row_to_resource)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Includes soft-deleted resources.
pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Resource>> {
    let mut stmt = conn.prepare("SELECT * FROM resources WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_resource)?;
    Ok(rows.next().transpose()?)
}

pub fn find_by_config_id(conn: &Connection, config_id: &str) -> anyhow::Result<Option<Resource>> {
    let mut stmt = conn.prepare("SELECT * FROM resources WHERE config_id = ?")?;
    let mut rows = stmt.query_map(params![config_id], row_to_resource)?;
    Ok(rows.next().transpose()?)
}

pub fn find_declared(conn: &Connection) -> anyhow::Result<Vec<Resource>> {
    let mut stmt = conn.prepare("SELECT * FROM resources WHERE config_id IS NOT NULL")?;
    let rows = stmt.query_map([], row_to_resource)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn find_included(conn: &Connection) -> anyhow::Result<Vec<Resource>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM resources WHERE deleted = 0 AND include_in_package = 1 ORDER BY name",
    )?;
    let rows = stmt.query_map([], row_to_resource)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn create(
    conn: &Connection,
    data: &CreateResourceRequest,
    config_id: Option<&str>,
) -> anyhow::Result<Resource> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO resources (id, name, engine, host, port, username, password, database_name, schedule, compression, retention_days, max_count, include_in_package, config_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            id,
            data.name,
            data.engine,
            data.host,
            data.port(),
            data.username,
            data.password,
            data.database_name,
            data.schedule,
            data.compression,
            data.retention_days,
            data.max_count,
            data.include_in_package,
            config_id,
            now,
            now,
        ],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created resource"))
}

/// Overwrite every definition field and clear the override/delete flags.
pub fn replace_definition(
    conn: &Connection,
    id: &str,
    data: &CreateResourceRequest,
) -> anyhow::Result<Option<Resource>> {
    let changes = conn.execute(
        "UPDATE resources SET name = ?1, engine = ?2, host = ?3, port = ?4, username = ?5, password = ?6,
           database_name = ?7, schedule = ?8, compression = ?9, retention_days = ?10, max_count = ?11,
           include_in_package = ?12, overridden = 0, deleted = 0, updated_at = ?13
         WHERE id = ?14",
        params![
            data.name,
            data.engine,
            data.host,
            data.port(),
            data.username,
            data.password,
            data.database_name,
            data.schedule,
            data.compression,
            data.retention_days,
            data.max_count,
            data.include_in_package,
            Utc::now(),
            id,
        ],
    )?;
    if changes == 0 {
        return Ok(None);
    }
    find_by_id(conn, id)
}

/// Apply a partial update. Declared resources become overridden.
pub fn update(
    conn: &Connection,
    id: &str,
    data: &UpdateResourceRequest,
) -> anyhow::Result<Option<Resource>> {
    if find_by_id(conn, id)?.is_none() {
        return Ok(None);
    }

    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref name) = data.name {
        sets.push("name = ?");
        values.push(Box::new(name.clone()));
    }
    if let Some(engine) = data.engine {
        sets.push("engine = ?");
        values.push(Box::new(engine));
    }
    if let Some(ref host) = data.host {
        sets.push("host = ?");
        values.push(Box::new(host.clone()));
    }
    if let Some(port) = data.port {
        sets.push("port = ?");
        values.push(Box::new(port));
    }
    if let Some(ref username) = data.username {
        sets.push("username = ?");
        values.push(Box::new(username.clone()));
    }
    if let Some(ref password) = data.password {
        sets.push("password = ?");
        values.push(Box::new(password.clone()));
    }
    if let Some(ref database_name) = data.database_name {
        sets.push("database_name = ?");
        values.push(Box::new(database_name.clone()));
    }
    if let Some(ref schedule) = data.schedule {
        sets.push("schedule = ?");
        values.push(Box::new(schedule.clone()));
    }
    if let Some(compression) = data.compression {
        sets.push("compression = ?");
        values.push(Box::new(compression));
    }
    if let Some(retention_days) = data.retention_days {
        sets.push("retention_days = ?");
        values.push(Box::new(retention_days));
    }
    if let Some(max_count) = data.max_count {
        sets.push("max_count = ?");
        values.push(Box::new(max_count));
    }
    if let Some(include) = data.include_in_package {
        sets.push("include_in_package = ?");
        values.push(Box::new(include));
    }

    if sets.is_empty() {
        return find_by_id(conn, id);
    }

    sets.push("overridden = CASE WHEN config_id IS NULL THEN 0 ELSE 1 END");
    sets.push("updated_at = ?");
    values.push(Box::new(Utc::now()));
    values.push(Box::new(id.to_string()));

    let sql = format!("UPDATE resources SET {} WHERE id = ?", sets.join(", "));
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    conn.execute(&sql, params.as_slice())?;
    find_by_id(conn, id)
}

pub fn soft_delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE resources SET deleted = 1, updated_at = ? WHERE id = ? AND config_id IS NOT NULL",
        params![Utc::now(), id],
    )?;
    Ok(changes > 0)
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM resources WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
