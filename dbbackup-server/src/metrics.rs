//! Prometheus metrics exposed on `/metrics`.

use crate::models::job::{Job, JobKind, JobStatus, TriggerOrigin};
use crate::models::resource::Resource;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::time::Duration;

lazy_static::lazy_static! {
    /// Finished jobs
    pub static ref JOBS: CounterVec = register_counter_vec!(
        "dbbackup_jobs_total",
        "Total number of finished jobs",
        &["resource", "kind", "status"]
    ).unwrap();

    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "dbbackup_job_duration_seconds",
        "Duration of backup and restore jobs",
        &["resource", "kind"],
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    pub static ref LAST_ARTIFACT_SIZE: GaugeVec = register_gauge_vec!(
        "dbbackup_last_artifact_size_bytes",
        "Size of the most recent backup artifact",
        &["resource"]
    ).unwrap();

    /// 1 when the last backup succeeded, 0 when it failed
    pub static ref LAST_JOB_STATUS: GaugeVec = register_gauge_vec!(
        "dbbackup_last_job_status",
        "Outcome of the most recent backup",
        &["resource"]
    ).unwrap();

    pub static ref LAST_SCHEDULED_SUCCESS: GaugeVec = register_gauge_vec!(
        "dbbackup_last_scheduled_success_timestamp",
        "Unix time of the last successful scheduled backup",
        &["resource"]
    ).unwrap();

    pub static ref TRANSFER_RATE: GaugeVec = register_gauge_vec!(
        "dbbackup_transfer_rate_bytes_per_second",
        "Artifact bytes written per second by the last backup",
        &["resource"]
    ).unwrap();

    /// 1 when the last artifact was stored with a checksum, 0 otherwise
    pub static ref INTEGRITY_STATUS: GaugeVec = register_gauge_vec!(
        "dbbackup_integrity_status",
        "Integrity of the most recent backup artifact",
        &["resource"]
    ).unwrap();

    pub static ref RETENTION_RUNS: CounterVec = register_counter_vec!(
        "dbbackup_retention_runs_total",
        "Retention passes executed",
        &["scope"]
    ).unwrap();

    pub static ref RETENTION_DELETIONS: CounterVec = register_counter_vec!(
        "dbbackup_retention_deletions_total",
        "Records removed by retention",
        &["scope"]
    ).unwrap();

    pub static ref PACKAGES: Gauge = register_gauge!(
        "dbbackup_packages_total",
        "Number of stored packages"
    ).unwrap();

    pub static ref PACKAGES_SIZE: Gauge = register_gauge!(
        "dbbackup_packages_size_bytes",
        "Total size of stored packages"
    ).unwrap();

    pub static ref PACKAGE_LAST_STATUS: Gauge = register_gauge!(
        "dbbackup_package_last_status",
        "Outcome of the most recent packaging attempt"
    ).unwrap();

    pub static ref DISK_AVAILABLE: Gauge = register_gauge!(
        "dbbackup_disk_available_bytes",
        "Free space on the volume holding the data directory"
    ).unwrap();
}

/// Record a finished job.
pub fn record_job(resource: &Resource, job: &Job, elapsed: Duration) {
    let name = resource.name.as_str();
    JOBS.with_label_values(&[name, job.kind.as_str(), job.status.as_str()])
        .inc();
    JOB_DURATION
        .with_label_values(&[name, job.kind.as_str()])
        .observe(elapsed.as_secs_f64());

    if job.kind != JobKind::Backup {
        return;
    }
    let ok = job.status == JobStatus::Completed;
    LAST_JOB_STATUS
        .with_label_values(&[name])
        .set(if ok { 1.0 } else { 0.0 });
    if !ok {
        INTEGRITY_STATUS.with_label_values(&[name]).set(0.0);
        return;
    }

    let size = job.size_bytes.unwrap_or(0) as f64;
    LAST_ARTIFACT_SIZE.with_label_values(&[name]).set(size);
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        TRANSFER_RATE.with_label_values(&[name]).set(size / secs);
    }
    let intact = job.checksum.is_some() && size > 0.0;
    INTEGRITY_STATUS
        .with_label_values(&[name])
        .set(if intact { 1.0 } else { 0.0 });
    if job.trigger == TriggerOrigin::Scheduled {
        let at = job.finished_at.unwrap_or_else(chrono::Utc::now);
        LAST_SCHEDULED_SUCCESS
            .with_label_values(&[name])
            .set(at.timestamp() as f64);
    }
}

pub fn record_retention(scope: &str, deleted: usize) {
    RETENTION_RUNS.with_label_values(&[scope]).inc();
    RETENTION_DELETIONS
        .with_label_values(&[scope])
        .inc_by(deleted as f64);
}

pub fn record_package(ok: bool) {
    PACKAGE_LAST_STATUS.set(if ok { 1.0 } else { 0.0 });
}

pub fn set_package_totals(count: i64, size_bytes: i64) {
    PACKAGES.set(count as f64);
    PACKAGES_SIZE.set(size_bytes as f64);
}

pub fn set_disk_available(bytes: u64) {
    DISK_AVAILABLE.set(bytes as f64);
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    encoder.encode_to_string(&families).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        record_retention("test-scope", 2);
        set_disk_available(1024);
        let text = render();
        assert!(text.contains("dbbackup_retention_deletions_total{scope=\"test-scope\"} 2"));
        assert!(text.contains("dbbackup_disk_available_bytes"));
    }
}
