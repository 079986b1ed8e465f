//! Bundles the latest artifact of every included resource into one archive.

use crate::db::with_conn;
use crate::metrics;
use crate::models::job::{self, JobKind, JobStatus, TriggerOrigin};
use crate::models::package::{self, Package, PackageFormat};
use crate::models::resource::{self, Resource};
use crate::services::pipeline::stream::digest_file;
use crate::services::storage::file_name;
use crate::services::{dispatch, retention};
use crate::state::AppState;
use crate::utils::timestamp_slug;
use anyhow::Context;
use chrono::Utc;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Build one package. Returns `None` when no resource is included.
pub async fn create_package(
    state: &AppState,
    format: PackageFormat,
    trigger: TriggerOrigin,
) -> anyhow::Result<Option<Package>> {
    let result = build(state, format, trigger).await;
    match &result {
        Ok(Some(pkg)) => {
            metrics::record_package(true);
            tracing::info!(package_id = %pkg.id, path = %pkg.storage_path, size = pkg.size_bytes, "Package created");
            if let Err(e) = retention::enforce_packages(state).await {
                tracing::error!(error = %e, "Package retention failed");
            }
        }
        Ok(None) => {}
        Err(e) => {
            metrics::record_package(false);
            tracing::error!(error = %format!("{e:#}"), "Packaging failed");
        }
    }
    result
}

async fn build(
    state: &AppState,
    format: PackageFormat,
    trigger: TriggerOrigin,
) -> anyhow::Result<Option<Package>> {
    let included = with_conn(&state.db, |conn| resource::find_included(conn)).await?;
    if included.is_empty() {
        tracing::info!("No resources are included in packages, nothing to do");
        return Ok(None);
    }

    let tmp_dir = state.config.tmp_dir();
    tokio::fs::create_dir_all(&tmp_dir).await?;
    let workdir = tempfile::Builder::new().prefix("package-").tempdir_in(&tmp_dir)?;

    let mut entries = Vec::with_capacity(included.len());
    for resource in &included {
        let artifact = latest_artifact(state, resource, trigger).await?;
        let entry = format!("{}/{}", resource.storage_dir(), file_name(&artifact));
        let local = workdir.path().join(&entry);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        state
            .storage
            .fetch_to_local(&artifact, &local)
            .await
            .with_context(|| format!("Failed to fetch {artifact} for {}", resource.name))?;
        entries.push((entry, local));
    }

    let bundle = tempfile::Builder::new()
        .prefix("bundle-")
        .tempfile_in(&tmp_dir)?
        .into_temp_path();
    let target = bundle.to_path_buf();
    tokio::task::spawn_blocking(move || write_bundle(format, &entries, &target))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

    let (size, checksum) = digest_file(&bundle).await?;
    let dest = format!(
        "packages/packaged_resources_{}{}",
        timestamp_slug(Utc::now()),
        format.extension()
    );
    state.storage.save(&bundle, &dest).await?;

    let pkg = with_conn(&state.db, move |conn| {
        package::create(conn, &dest, size as i64, &checksum, trigger)
    })
    .await?;
    Ok(Some(pkg))
}

/// Storage path of the newest completed backup, running one first when there is none.
async fn latest_artifact(
    state: &AppState,
    resource: &Resource,
    trigger: TriggerOrigin,
) -> anyhow::Result<String> {
    let rid = resource.id.clone();
    let existing = with_conn(&state.db, move |conn| job::latest_completed_backup(conn, &rid)).await?;
    if let Some(path) = existing.and_then(|j| j.storage_path) {
        return Ok(path);
    }

    tracing::info!(resource = %resource.name, "No backup available for package, running one now");
    let rid = resource.id.clone();
    let created = with_conn(&state.db, move |conn| job::create(conn, &rid, JobKind::Backup, trigger)).await?;
    let done = dispatch::execute_backup(state, &created.id, &resource.id)
        .await
        .with_context(|| format!("Backup for {} could not be executed", resource.name))?;

    match (done.status, done.storage_path) {
        (JobStatus::Completed, Some(path)) => Ok(path),
        _ => anyhow::bail!(
            "Backup for {} failed: {}",
            resource.name,
            done.error_summary.unwrap_or_default()
        ),
    }
}

fn write_bundle(format: PackageFormat, entries: &[(String, PathBuf)], target: &Path) -> anyhow::Result<()> {
    let file = File::create(target)
        .with_context(|| format!("Failed to create bundle {}", target.display()))?;
    match format {
        PackageFormat::Zip => {
            let mut zip = zip::ZipWriter::new(BufWriter::new(file));
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .large_file(true);
            for (name, path) in entries {
                zip.start_file(name.as_str(), options)?;
                let mut src = File::open(path)?;
                std::io::copy(&mut src, &mut zip)?;
            }
            zip.finish()?.flush()?;
        }
        PackageFormat::TarGz => {
            let enc = flate2::write::GzEncoder::new(BufWriter::new(file), flate2::Compression::default());
            let mut tar = tar::Builder::new(enc);
            for (name, path) in entries {
                tar.append_path_with_name(path, name)
                    .with_context(|| format!("Failed to append {name} to archive"))?;
            }
            tar.into_inner()?.finish()?.flush()?;
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::resource::{Compression, UpdateResourceRequest};
    use crate::test_support::{create_resource, TestEnv};
    use std::io::Read;

    async fn include(env: &TestEnv, resource_id: &str) {
        let rid = resource_id.to_string();
        with_conn(&env.state.db, move |conn| {
            let patch = UpdateResourceRequest {
                include_in_package: Some(true),
                ..Default::default()
            };
            resource::update(conn, &rid, &patch)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_included_resources_is_a_noop() {
        let env = TestEnv::new(false).await;
        create_resource(&env.state, "Main DB", Compression::None).await;

        let pkg = create_package(&env.state, PackageFormat::Zip, TriggerOrigin::Manual).await.unwrap();
        assert!(pkg.is_none());
        let all = with_conn(&env.state.db, |conn| package::find_all(conn)).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zip_package_runs_missing_backup_and_bundles_it() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "printf 'orders dump'");
        let resource = create_resource(&env.state, "Orders", Compression::None).await;
        include(&env, &resource.id).await;

        let pkg = create_package(&env.state, PackageFormat::Zip, TriggerOrigin::Manual)
            .await
            .unwrap()
            .unwrap();
        assert!(pkg.storage_path.starts_with("packages/packaged_resources_"));
        assert!(pkg.storage_path.ends_with(".zip"));

        let file = File::open(env.storage_root().join(&pkg.storage_path)).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_index(0).unwrap();
        assert!(entry.name().starts_with(&format!("{}/postgres_", resource.storage_dir())));
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "orders dump");
        assert!(env.tmp_is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_backup_aborts_package() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "echo 'could not connect to server' >&2; exit 1");
        let resource = create_resource(&env.state, "Orders", Compression::None).await;
        include(&env, &resource.id).await;

        let err = create_package(&env.state, PackageFormat::TarGz, TriggerOrigin::Scheduled).await;
        assert!(err.is_err());
        let all = with_conn(&env.state.db, |conn| package::find_all(conn)).await.unwrap();
        assert!(all.is_empty());
        assert!(env.tmp_is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resources_with_same_slug_get_separate_entries() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "printf 'same'");
        let upper = create_resource(&env.state, "Main DB", Compression::None).await;
        let lower = create_resource(&env.state, "main db", Compression::None).await;
        include(&env, &upper.id).await;
        include(&env, &lower.id).await;

        let pkg = create_package(&env.state, PackageFormat::Zip, TriggerOrigin::Manual)
            .await
            .unwrap()
            .unwrap();
        let file = File::open(env.storage_root().join(&pkg.storage_path)).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 2);

        let (a, b) = (upper.id.clone(), lower.id.clone());
        let paths = with_conn(&env.state.db, move |conn| {
            Ok((job::latest_completed_backup(conn, &a)?, job::latest_completed_backup(conn, &b)?))
        })
        .await
        .unwrap();
        assert_ne!(paths.0.unwrap().storage_path, paths.1.unwrap().storage_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tar_gz_package_contains_entries() {
        let env = TestEnv::new(false).await;
        env.tool("pg_dump", "printf 'a'");
        let first = create_resource(&env.state, "Alpha", Compression::Gzip).await;
        let second = create_resource(&env.state, "Beta", Compression::None).await;
        include(&env, &first.id).await;
        include(&env, &second.id).await;

        let pkg = create_package(&env.state, PackageFormat::TarGz, TriggerOrigin::Manual)
            .await
            .unwrap()
            .unwrap();
        let file = File::open(env.storage_root().join(&pkg.storage_path)).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with(&format!("{}/", first.storage_dir())) && names[0].ends_with(".dump.gz"));
        assert!(names[1].starts_with(&format!("{}/", second.storage_dir())) && names[1].ends_with(".dump"));
    }
}
