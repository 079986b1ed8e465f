//! Shared fixtures: a throwaway data directory, database and local storage,
//! with stand-in tool scripts installed under `bin/`.

use crate::config::{AppConfig, StorageConfig, ToolPaths};
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::db::with_conn;
use crate::models::job::{self, Job, JobKind, TriggerOrigin};
use crate::models::resource::{self, Compression, CreateResourceRequest, EngineKind, Resource, UpdateResourceRequest};
use crate::services::storage::LocalStorage;
use crate::state::AppState;
use std::path::PathBuf;
use std::sync::Arc;

pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub state: Arc<AppState>,
}

impl TestEnv {
    pub async fn new(restore_mode: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = |name: &str| bin.join(name).to_string_lossy().into_owned();

        let storage_root = root.join("storage");
        let config = AppConfig {
            port: 0,
            data_dir: root.join("data"),
            db_path: root.join("test.db"),
            config_file: root.join("config.yaml"),
            log_level: "info".into(),
            worker_pool_size: 2,
            restore_mode,
            storage: StorageConfig::Local { root: storage_root.clone() },
            tools: ToolPaths {
                pg_dump: tool("pg_dump"),
                pg_restore: tool("pg_restore"),
                mysqldump: tool("mysqldump"),
                mysql: tool("mysql"),
                mongodump: tool("mongodump"),
                mongorestore: tool("mongorestore"),
            },
            retention_cron: "0 0 1 * * *".into(),
            disk_refresh_cron: "0 */5 * * * *".into(),
        };
        std::fs::create_dir_all(&config.data_dir).unwrap();

        let pool = create_pool(&config.db_path).unwrap();
        migrate(&pool).unwrap();
        let storage = Arc::new(LocalStorage::new(storage_root).unwrap());
        let state = AppState::build(pool, config, storage).await.unwrap();
        Self { dir, state }
    }

    /// Install an executable shell script as one of the configured tools.
    #[cfg(unix)]
    pub fn tool(&self, name: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = self.dir.path().join("bin").join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn storage_root(&self) -> PathBuf {
        self.dir.path().join("storage")
    }

    pub fn put_artifact(&self, path: &str, contents: &[u8]) {
        let full = self.storage_root().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }

    /// True when no scratch files are left behind.
    pub fn tmp_is_empty(&self) -> bool {
        match std::fs::read_dir(self.state.config.tmp_dir()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    pub async fn job(&self, id: &str) -> Job {
        let id = id.to_string();
        with_conn(&self.state.db, move |conn| job::find_by_id(conn, &id))
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn set_engine(&self, id: &str, engine: EngineKind) -> Resource {
        let id = id.to_string();
        with_conn(&self.state.db, move |conn| {
            let patch = UpdateResourceRequest {
                engine: Some(engine),
                port: Some(engine.default_port()),
                ..Default::default()
            };
            resource::update(conn, &id, &patch)
        })
        .await
        .unwrap()
        .unwrap()
    }

    pub fn write_config(&self, yaml: &str) {
        std::fs::write(&self.state.config.config_file, yaml).unwrap();
    }
}

pub fn resource_request(name: &str, compression: Compression) -> CreateResourceRequest {
    CreateResourceRequest {
        name: name.into(),
        engine: EngineKind::Postgres,
        host: "127.0.0.1".into(),
        port: None,
        username: "backup".into(),
        password: "secret".into(),
        database_name: "app".into(),
        schedule: None,
        compression,
        retention_days: None,
        max_count: None,
        include_in_package: false,
    }
}

pub async fn create_resource(state: &AppState, name: &str, compression: Compression) -> Resource {
    let data = resource_request(name, compression);
    with_conn(&state.db, move |conn| resource::create(conn, &data, None))
        .await
        .unwrap()
}

pub async fn create_job(state: &AppState, resource_id: &str, kind: JobKind, trigger: TriggerOrigin) -> Job {
    let rid = resource_id.to_string();
    with_conn(&state.db, move |conn| job::create(conn, &rid, kind, trigger))
        .await
        .unwrap()
}
