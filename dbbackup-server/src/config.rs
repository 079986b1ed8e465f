use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub presign_ttl: Duration,
    /// Stream downloads through the server instead of redirecting to a presigned URL.
    pub proxy_downloads: bool,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local { root: PathBuf },
    S3(S3Config),
}

/// Locations of the external dump and restore binaries.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub pg_dump: String,
    pub pg_restore: String,
    pub mysqldump: String,
    pub mysql: String,
    pub mongodump: String,
    pub mongorestore: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            pg_dump: "pg_dump".into(),
            pg_restore: "pg_restore".into(),
            mysqldump: "mysqldump".into(),
            mysql: "mysql".into(),
            mongodump: "mongodump".into(),
            mongorestore: "mongorestore".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_file: PathBuf,
    pub log_level: String,
    pub worker_pool_size: usize,
    pub restore_mode: bool,
    pub storage: StorageConfig,
    pub tools: ToolPaths,
    pub retention_cron: String,
    pub disk_refresh_cron: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "data".into()));

        let storage = match get("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "local" => StorageConfig::Local {
                root: get("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| data_dir.join("storage")),
            },
            "s3" => {
                let required = |key: &str| {
                    get(key).with_context(|| format!("{key} is required when STORAGE_BACKEND=s3"))
                };
                StorageConfig::S3(S3Config {
                    endpoint: required("S3_ENDPOINT")?,
                    region: get("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
                    access_key: required("S3_ACCESS_KEY")?,
                    secret_key: required("S3_SECRET_KEY")?,
                    bucket: required("S3_BUCKET")?,
                    presign_ttl: Duration::from_secs(
                        get("S3_PRESIGN_TTL_SECS")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(3600),
                    ),
                    proxy_downloads: get("S3_PROXY_DOWNLOADS").is_some_and(|v| parse_bool(&v)),
                })
            }
            other => anyhow::bail!("Unsupported STORAGE_BACKEND '{other}' (expected local or s3)"),
        };

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            pg_dump: get("PG_DUMP_BIN").unwrap_or(defaults.pg_dump),
            pg_restore: get("PG_RESTORE_BIN").unwrap_or(defaults.pg_restore),
            mysqldump: get("MYSQLDUMP_BIN").unwrap_or(defaults.mysqldump),
            mysql: get("MYSQL_BIN").unwrap_or(defaults.mysql),
            mongodump: get("MONGODUMP_BIN").unwrap_or(defaults.mongodump),
            mongorestore: get("MONGORESTORE_BIN").unwrap_or(defaults.mongorestore),
        };

        Ok(Self {
            port: get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8000),
            db_path: get("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("backup.db")),
            config_file: PathBuf::from(get("CONFIG_FILE").unwrap_or_else(|| "config.yaml".into())),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            worker_pool_size: get("WORKER_POOL_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(4),
            restore_mode: get("RESTORE_MODE").is_some_and(|v| parse_bool(&v)),
            storage,
            tools,
            retention_cron: get("RETENTION_CRON").unwrap_or_else(|| "0 0 1 * * *".into()),
            disk_refresh_cron: get("DISK_REFRESH_CRON").unwrap_or_else(|| "0 */5 * * * *".into()),
            data_dir,
        })
    }

    /// Scratch space for in-flight dumps, restores and package bundles.
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
