use super::{file_name, validate_path, Download, StorageError, StorageProvider};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn save(&self, source: &Path, dest: &str) -> Result<(), StorageError> {
        let target = self.resolve(dest)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(dest, e))?;
        }

        if tokio::fs::rename(source, &target).await.is_ok() {
            return Ok(());
        }

        // Different filesystem: copy next to the target, then rename into place
        let mut part = target.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);
        if let Err(e) = tokio::fs::copy(source, &part).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(StorageError::io(dest, e));
        }
        if let Err(e) = tokio::fs::rename(&part, &target).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(StorageError::io(dest, e));
        }
        if let Err(e) = tokio::fs::remove_file(source).await {
            tracing::warn!(source = %source.display(), "Failed to remove staged file: {}", e);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn fetch_to_local(&self, path: &str, dest: &Path) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::copy(&target, dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn download(&self, path: &str) -> Result<Download, StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => Ok(Download::File {
                path: target,
                file_name: file_name(path),
            }),
            Ok(_) => Err(StorageError::NotFound(path.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}
