//! Declarative resource definitions loaded from a YAML document.
//!
//! A sync either applies the whole document in one transaction or nothing.
//! Entries whose credentials cannot be resolved are skipped with a warning.

use crate::db::with_conn;
use crate::models::package::PackageConfig;
use crate::models::resource::{self, Compression, CreateResourceRequest, EngineKind};
use crate::models::settings;
use crate::services::backup_scheduler::validate_cron;
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("duplicate resource ids: {0}")]
    DuplicateIds(String),

    #[error("resource entry #{index} is missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("resource '{id}' has an invalid schedule: {reason}")]
    InvalidSchedule { id: String, reason: String },

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Defaults applied to every entry that leaves the field unset.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GlobalDefaults {
    pub schedule: Option<String>,
    pub compression: Option<Compression>,
    pub retention_days: Option<u32>,
    #[serde(alias = "max_backups")]
    pub max_count: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ResourceEntry {
    pub id: Option<String>,
    pub name: Option<String>,
    pub engine: Option<EngineKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_name: Option<String>,
    pub username: Option<String>,
    #[serde(alias = "usernameVar")]
    pub username_var: Option<String>,
    pub password: Option<String>,
    #[serde(alias = "passwordVar")]
    pub password_var: Option<String>,
    pub schedule: Option<String>,
    #[serde(alias = "scheduleVar")]
    pub schedule_var: Option<String>,
    pub compression: Option<Compression>,
    pub retention_days: Option<u32>,
    #[serde(alias = "max_backups")]
    pub max_count: Option<u32>,
    #[serde(alias = "package")]
    pub include_in_package: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub global: GlobalDefaults,
    #[serde(default, alias = "databases")]
    pub resources: Vec<ResourceEntry>,
    #[serde(default)]
    pub package: Option<PackageConfig>,
}

impl ConfigDocument {
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document is valid and declares nothing
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str::<Option<Self>>(yaml)?.unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct DeclaredResource {
    pub config_id: String,
    pub spec: CreateResourceRequest,
}

#[derive(Debug, Default)]
pub struct Resolved {
    pub resources: Vec<DeclaredResource>,
    /// Config ids skipped because their credentials could not be resolved.
    pub skipped: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Left alone because they were edited or deleted through the API.
    pub preserved: usize,
    pub skipped: Vec<String>,
}

/// Validate the document and merge every entry with the global defaults.
pub fn resolve(doc: &ConfigDocument, env: impl Fn(&str) -> Option<String>) -> Result<Resolved, ConfigError> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for (index, entry) in doc.resources.iter().enumerate() {
        let id = entry
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingField { index, field: "id" })?;
        if !seen.insert(id) && !duplicates.contains(&id) {
            duplicates.push(id);
        }
    }
    if !duplicates.is_empty() {
        return Err(ConfigError::DuplicateIds(duplicates.join(", ")));
    }

    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    let from_env = |var: &Option<String>| var.as_deref().and_then(|v| non_empty(env(v)));

    let mut resolved = Resolved::default();
    for (index, entry) in doc.resources.iter().enumerate() {
        let config_id = entry.id.as_deref().unwrap_or_default().trim().to_string();
        let engine = entry.engine.ok_or(ConfigError::MissingField { index, field: "engine" })?;
        let host = non_empty(entry.host.clone()).ok_or(ConfigError::MissingField { index, field: "host" })?;
        let database_name = non_empty(entry.database_name.clone())
            .ok_or(ConfigError::MissingField { index, field: "database_name" })?;

        let schedule = from_env(&entry.schedule_var)
            .or_else(|| non_empty(entry.schedule.clone()))
            .or_else(|| non_empty(doc.global.schedule.clone()));
        if let Some(expr) = &schedule {
            validate_cron(expr).map_err(|reason| ConfigError::InvalidSchedule {
                id: config_id.clone(),
                reason,
            })?;
        }

        let username = non_empty(entry.username.clone()).or_else(|| from_env(&entry.username_var));
        let password = non_empty(entry.password.clone()).or_else(|| from_env(&entry.password_var));
        let (Some(username), Some(password)) = (username, password) else {
            tracing::warn!(config_id = %config_id, "Skipping declared resource: missing credentials");
            resolved.skipped.push(config_id);
            continue;
        };

        resolved.resources.push(DeclaredResource {
            spec: CreateResourceRequest {
                name: non_empty(entry.name.clone()).unwrap_or_else(|| config_id.clone()),
                engine,
                host,
                port: entry.port,
                username,
                password,
                database_name,
                schedule,
                compression: entry.compression.or(doc.global.compression).unwrap_or_default(),
                retention_days: entry.retention_days.or(doc.global.retention_days),
                max_count: entry.max_count.or(doc.global.max_count),
                include_in_package: entry.include_in_package.unwrap_or(false),
            },
            config_id,
        });
    }
    Ok(resolved)
}

/// Upsert every declared resource, leaving overridden and deleted ones untouched.
pub fn apply(
    conn: &mut rusqlite::Connection,
    resolved: &Resolved,
    package: Option<&PackageConfig>,
) -> anyhow::Result<SyncReport> {
    let tx = conn.transaction()?;
    let mut report = SyncReport {
        skipped: resolved.skipped.clone(),
        ..Default::default()
    };

    for declared in &resolved.resources {
        match resource::find_by_config_id(&tx, &declared.config_id)? {
            None => {
                resource::create(&tx, &declared.spec, Some(&declared.config_id))?;
                tracing::info!(config_id = %declared.config_id, "Declared resource created");
                report.created += 1;
            }
            Some(existing) => match existing.provenance {
                resource::Provenance::Declared { overridden: true, .. } => {
                    tracing::info!(config_id = %declared.config_id, "Keeping resource edited through the API");
                    report.preserved += 1;
                }
                resource::Provenance::Declared { deleted: true, .. } => {
                    tracing::info!(config_id = %declared.config_id, "Keeping resource deleted through the API");
                    report.preserved += 1;
                }
                _ => {
                    resource::replace_definition(&tx, &existing.id, &declared.spec)?;
                    report.updated += 1;
                }
            },
        }
    }

    if let Some(package) = package {
        settings::set_package_config(&tx, package)?;
    }
    tx.commit()?;
    Ok(report)
}

/// Make the declared set exactly the document: upsert by id with flags
/// cleared, and delete declared resources the document no longer lists.
pub fn replace_all(
    conn: &mut rusqlite::Connection,
    resolved: &Resolved,
    package: Option<&PackageConfig>,
) -> anyhow::Result<SyncReport> {
    let tx = conn.transaction()?;
    let mut report = SyncReport {
        skipped: resolved.skipped.clone(),
        ..Default::default()
    };

    let keep: HashSet<&str> = resolved.resources.iter().map(|d| d.config_id.as_str()).collect();
    for existing in resource::find_declared(&tx)? {
        if !existing.config_id().is_some_and(|id| keep.contains(id)) {
            resource::delete(&tx, &existing.id)?;
            report.deleted += 1;
        }
    }

    for declared in &resolved.resources {
        match resource::find_by_config_id(&tx, &declared.config_id)? {
            Some(existing) => {
                resource::replace_definition(&tx, &existing.id, &declared.spec)?;
                report.updated += 1;
            }
            None => {
                resource::create(&tx, &declared.spec, Some(&declared.config_id))?;
                report.created += 1;
            }
        }
    }

    if let Some(package) = package {
        settings::set_package_config(&tx, package)?;
    }
    tx.commit()?;
    Ok(report)
}

async fn read_document(path: &Path) -> Result<Option<String>, ConfigError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io { path: path.to_path_buf(), source }),
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Load the configured document and apply it. A missing file declares nothing.
pub async fn sync_from_file(state: &AppState) -> Result<SyncReport, ConfigError> {
    let path = &state.config.config_file;
    let Some(text) = read_document(path).await? else {
        tracing::info!(path = %path.display(), "No declarative config found, skipping sync");
        return Ok(SyncReport::default());
    };
    let doc = ConfigDocument::parse(&text)?;
    let resolved = resolve(&doc, env_lookup)?;

    let report = with_conn(&state.db, move |conn| apply(conn, &resolved, doc.package.as_ref())).await?;
    tracing::info!(
        created = report.created,
        updated = report.updated,
        preserved = report.preserved,
        skipped = report.skipped.len(),
        "Declarative config synced"
    );
    Ok(report)
}

/// Validate `yaml`, replace every declared resource with its entries and
/// persist it as the new document.
pub async fn replace_document(state: &AppState, yaml: &str) -> Result<SyncReport, ConfigError> {
    let doc = ConfigDocument::parse(yaml)?;
    let resolved = resolve(&doc, env_lookup)?;

    let path = state.config.config_file.clone();
    let staged = staging_path(&path);
    write_file(&staged, yaml).await?;

    let applied = with_conn(&state.db, move |conn| replace_all(conn, &resolved, doc.package.as_ref())).await;
    let report = match applied {
        Ok(report) => report,
        Err(e) => {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }
    };
    tokio::fs::rename(&staged, &path)
        .await
        .map_err(|source| ConfigError::Io { path: path.clone(), source })?;

    tracing::info!(
        created = report.created,
        updated = report.updated,
        deleted = report.deleted,
        skipped = report.skipped.len(),
        "Declarative config replaced"
    );
    Ok(report)
}

/// The current document's definition for `config_id`. `Ok(None)` when the
/// document no longer declares it.
pub async fn declared_entry(state: &AppState, config_id: &str) -> Result<Option<DeclaredEntry>, ConfigError> {
    let Some(text) = read_document(&state.config.config_file).await? else {
        return Ok(None);
    };
    let doc = ConfigDocument::parse(&text)?;
    let resolved = resolve(&doc, env_lookup)?;
    if resolved.skipped.iter().any(|id| id == config_id) {
        return Ok(Some(DeclaredEntry::MissingCredentials));
    }
    Ok(resolved
        .resources
        .into_iter()
        .find(|d| d.config_id == config_id)
        .map(|d| DeclaredEntry::Definition(Box::new(d.spec))))
}

#[derive(Debug)]
pub enum DeclaredEntry {
    Definition(Box<CreateResourceRequest>),
    MissingCredentials,
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

async fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigError::Io { path: parent.to_path_buf(), source })?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}
