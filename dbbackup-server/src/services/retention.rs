//! Time and count based cleanup of backup artifacts and packages.

use crate::db::with_conn;
use crate::metrics;
use crate::models::job::{self, Job};
use crate::models::package::{self, Package};
use crate::models::{resource, settings};
use crate::state::AppState;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

/// Something retention can age out.
pub trait Retainable {
    fn retained_at(&self) -> DateTime<Utc>;
}

impl Retainable for Job {
    fn retained_at(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.started_at)
    }
}

impl Retainable for Package {
    fn retained_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Indices into `items` of everything older than `retention_days` or past the
/// newest `max_count`. Each index appears once.
pub fn select_expired<T: Retainable>(
    items: &[T],
    retention_days: Option<u32>,
    max_count: Option<u32>,
    now: DateTime<Utc>,
) -> Vec<usize> {
    let mut expired = BTreeSet::new();

    if let Some(days) = retention_days {
        let cutoff = now - Duration::days(i64::from(days));
        expired.extend(
            items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.retained_at() < cutoff)
                .map(|(i, _)| i),
        );
    }

    if let Some(keep) = max_count {
        let mut newest_first: Vec<usize> = (0..items.len()).collect();
        newest_first.sort_by_key(|&i| std::cmp::Reverse(items[i].retained_at()));
        expired.extend(newest_first.into_iter().skip(keep as usize));
    }

    expired.into_iter().collect()
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RetentionReport {
    pub deleted: usize,
    pub failures: Vec<String>,
}

impl RetentionReport {
    fn merge(&mut self, other: RetentionReport) {
        self.deleted += other.deleted;
        self.failures.extend(other.failures);
    }
}

/// Apply backup retention to one resource, or to every listed resource.
pub async fn enforce(state: &AppState, resource_id: Option<&str>) -> anyhow::Result<RetentionReport> {
    let rid = resource_id.map(str::to_string);
    let resources = with_conn(&state.db, move |conn| match rid {
        Some(id) => Ok(resource::find_by_id(conn, &id)?.into_iter().collect()),
        None => resource::find_all(conn),
    })
    .await?;

    let mut report = RetentionReport::default();
    let now = Utc::now();
    for resource in resources {
        if resource.retention_days.is_none() && resource.max_count.is_none() {
            continue;
        }
        let rid = resource.id.clone();
        let backups = with_conn(&state.db, move |conn| job::completed_backups(conn, &rid)).await?;
        let expired = select_expired(&backups, resource.retention_days, resource.max_count, now);
        if expired.is_empty() {
            continue;
        }

        let mut scoped = RetentionReport::default();
        for i in expired {
            match remove_job(state, &backups[i]).await {
                Ok(()) => scoped.deleted += 1,
                Err(e) => {
                    tracing::warn!(job_id = %backups[i].id, resource = %resource.name, error = %e, "Retention could not remove backup");
                    scoped.failures.push(format!("{}: {e}", backups[i].id));
                }
            }
        }
        tracing::info!(resource = %resource.name, deleted = scoped.deleted, failures = scoped.failures.len(), "Backup retention applied");
        metrics::record_retention(&resource.name, scoped.deleted);
        report.merge(scoped);
    }
    Ok(report)
}

async fn remove_job(state: &AppState, job: &Job) -> anyhow::Result<()> {
    if let Some(path) = &job.storage_path {
        state.storage.delete(path).await?;
    }
    let id = job.id.clone();
    with_conn(&state.db, move |conn| job::delete(conn, &id)).await?;
    Ok(())
}

/// Apply the package configuration's policy to every stored package.
pub async fn enforce_packages(state: &AppState) -> anyhow::Result<RetentionReport> {
    let (config, packages) = with_conn(&state.db, |conn| {
        Ok((settings::package_config(conn)?, package::find_all(conn)?))
    })
    .await?;

    let mut report = RetentionReport::default();
    let expired = select_expired(&packages, config.retention_days, config.max_count, Utc::now());
    for i in expired {
        let pkg = &packages[i];
        if let Err(e) = state.storage.delete(&pkg.storage_path).await {
            tracing::warn!(package_id = %pkg.id, error = %e, "Retention could not remove package");
            report.failures.push(format!("{}: {e}", pkg.id));
            continue;
        }
        let id = pkg.id.clone();
        with_conn(&state.db, move |conn| package::delete(conn, &id)).await?;
        report.deleted += 1;
    }

    if report.deleted > 0 || !report.failures.is_empty() {
        tracing::info!(deleted = report.deleted, failures = report.failures.len(), "Package retention applied");
    }
    metrics::record_retention("packages", report.deleted);
    refresh_package_totals(state).await?;
    Ok(report)
}

/// Daily sweep over every resource and the package store.
pub async fn sweep(state: &AppState) -> anyhow::Result<RetentionReport> {
    let mut report = enforce(state, None).await?;
    report.merge(enforce_packages(state).await?);
    tracing::info!(deleted = report.deleted, failures = report.failures.len(), "Retention sweep finished");
    Ok(report)
}

pub async fn refresh_package_totals(state: &AppState) -> anyhow::Result<()> {
    let (count, size) = with_conn(&state.db, |conn| package::totals(conn)).await?;
    metrics::set_package_totals(count, size);
    Ok(())
}
