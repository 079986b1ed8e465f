use super::{file_name, validate_path, Download, StorageError, StorageProvider};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::presigning::PresigningConfig;
use s3::primitives::ByteStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    presign_ttl: Duration,
    proxy_downloads: bool,
    tmp_dir: PathBuf,
}

impl S3Storage {
    pub async fn connect(config: &S3Config, tmp_dir: PathBuf) -> anyhow::Result<Self> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        // Self-hosted S3 implementations rarely support virtual-hosted buckets
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        let storage = Self {
            client: s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            presign_ttl: config.presign_ttl,
            proxy_downloads: config.proxy_downloads,
            tmp_dir,
        };
        storage.ensure_bucket().await?;
        Ok(storage)
    }

    async fn ensure_bucket(&self) -> anyhow::Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if !missing {
                    anyhow::bail!(
                        "Cannot access bucket {}: {}",
                        self.bucket,
                        DisplayErrorContext(&err)
                    );
                }
                tracing::info!(bucket = %self.bucket, "Bucket not found, creating");
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!(
                            "Failed to create bucket {}: {}",
                            self.bucket,
                            DisplayErrorContext(&e)
                        )
                    })?;
                Ok(())
            }
        }
    }
}

fn remote(path: &str, err: impl std::error::Error) -> StorageError {
    StorageError::Remote {
        path: path.to_string(),
        message: DisplayErrorContext(&err).to_string(),
    }
}

#[async_trait]
impl StorageProvider for S3Storage {
    fn backend(&self) -> &'static str {
        "s3"
    }

    async fn save(&self, source: &Path, dest: &str) -> Result<(), StorageError> {
        validate_path(dest)?;
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| remote(dest, e))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(dest)
            .body(body)
            .send()
            .await
            .map_err(|e| remote(dest, e))?;

        if let Err(e) = tokio::fs::remove_file(source).await {
            tracing::warn!(source = %source.display(), "Failed to remove staged file: {}", e);
        }
        tracing::debug!(bucket = %self.bucket, key = %dest, "Object uploaded");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| remote(path, e))?;
        Ok(())
    }

    async fn fetch_to_local(&self, path: &str, dest: &Path) -> Result<(), StorageError> {
        validate_path(path)?;
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(path.to_string())
                } else {
                    remote(path, e)
                }
            })?;

        let reader = object.body.into_async_read();
        tokio::pin!(reader);
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Download, StorageError> {
        validate_path(path)?;
        if self.proxy_downloads {
            tokio::fs::create_dir_all(&self.tmp_dir)
                .await
                .map_err(|e| StorageError::io(path, e))?;
            let file = tempfile::Builder::new()
                .prefix("download-")
                .tempfile_in(&self.tmp_dir)
                .map_err(|e| StorageError::io(path, e))?
                .into_temp_path();
            self.fetch_to_local(path, &file).await?;
            return Ok(Download::Temp {
                file,
                file_name: file_name(path),
            });
        }

        let presign = PresigningConfig::expires_in(self.presign_ttl).map_err(|e| remote(path, e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(presign)
            .await
            .map_err(|e| remote(path, e))?;
        Ok(Download::Redirect(request.uri().to_string()))
    }
}
