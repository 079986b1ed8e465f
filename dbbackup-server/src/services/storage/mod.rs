//! Artifact storage behind a single async trait, backed by local disk or an
//! S3-compatible object store. The backend is chosen once at startup.

pub mod local;
pub mod s3;

use crate::config::{AppConfig, StorageConfig};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub use local::LocalStorage;
pub use s3::S3Storage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage path '{0}'")]
    InvalidPath(String),

    #[error("artifact '{0}' not found")]
    NotFound(String),

    #[error("storage I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object store error on '{path}': {message}")]
    Remote { path: String, message: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io { path: path.into(), source }
    }
}

/// How an artifact should be handed to an HTTP client.
pub enum Download {
    /// Stream a file that lives in local storage.
    File { path: PathBuf, file_name: String },
    /// Send the client elsewhere, e.g. a presigned URL.
    Redirect(String),
    /// Stream a temporary copy, removed when dropped.
    Temp {
        file: tempfile::TempPath,
        file_name: String,
    },
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Move a finished local file into storage at `dest`. The source file is
    /// consumed. Readers never observe a partially written artifact.
    async fn save(&self, source: &Path, dest: &str) -> Result<(), StorageError>;

    /// Remove an artifact. Deleting an absent path succeeds.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Copy an artifact to a local file.
    async fn fetch_to_local(&self, path: &str, dest: &Path) -> Result<(), StorageError>;

    async fn download(&self, path: &str) -> Result<Download, StorageError>;
}

pub async fn from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn StorageProvider>> {
    let storage: Arc<dyn StorageProvider> = match &config.storage {
        StorageConfig::Local { root } => Arc::new(LocalStorage::new(root.clone())?),
        StorageConfig::S3(s3) => Arc::new(S3Storage::connect(s3, config.tmp_dir()).await?),
    };
    tracing::info!(backend = storage.backend(), "Storage provider ready");
    Ok(storage)
}

/// Storage paths are relative, `/`-separated and never escape the root.
pub fn validate_path(path: &str) -> Result<(), StorageError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || Path::new(path)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if invalid {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Last segment of a storage path.
pub fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
