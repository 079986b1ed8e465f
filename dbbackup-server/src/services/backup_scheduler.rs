use crate::db::with_conn;
use crate::models::resource::{self, Resource};
use crate::models::settings;
use crate::models::job::TriggerOrigin;
use crate::services::{disk, dispatch, packager, retention};
use crate::state::AppState;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

const PACKAGE_TIMER: &str = "system:package";
const RETENTION_TIMER: &str = "system:retention";
const DISK_TIMER: &str = "system:disk";

#[derive(Debug, Clone)]
struct Timer {
    id: Uuid,
    cron: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
}

/// Accept standard 5-field crontab and the scheduler's seconds-first form.
pub fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Normalized form of `expr`, or why it cannot be scheduled.
pub fn validate_cron(expr: &str) -> Result<String, String> {
    let normalized = normalize_cron(expr);
    let fields = normalized.split(' ').filter(|f| !f.is_empty()).count();
    if !(6..=7).contains(&fields) {
        return Err(format!("expected 5, 6 or 7 fields, got {}", expr.split_whitespace().count()));
    }
    Job::new_async(normalized.as_str(), |_uuid, _lock| Box::pin(async {}))
        .map(|_| normalized.clone())
        .map_err(|e| e.to_string())
}

/// Marks a timer as in flight; cleared on drop.
struct RunningGuard {
    set: Arc<DashSet<String>>,
    key: String,
}

impl RunningGuard {
    fn try_acquire(set: &Arc<DashSet<String>>, key: &str) -> Option<Self> {
        set.insert(key.to_string()).then(|| Self {
            set: set.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Weak<AppState>,
    timers: DashMap<String, Timer>,
    system_timers: DashMap<&'static str, Timer>,
    running: Arc<DashSet<String>>,
}

impl BackupScheduler {
    pub fn new(scheduler: JobScheduler, state: Weak<AppState>) -> Self {
        Self {
            scheduler: Mutex::new(scheduler),
            state,
            timers: DashMap::new(),
            system_timers: DashMap::new(),
            running: Arc::new(DashSet::new()),
        }
    }

    /// A cron job that hands each firing to the worker pool. A firing is
    /// skipped while the previous one for the same key is still running.
    fn timer_job<F, Fut>(&self, cron: &str, key: String, task: F) -> anyhow::Result<Job>
    where
        F: Fn(Arc<AppState>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let state = self.state.clone();
        let running = self.running.clone();
        let task = Arc::new(task);

        let job = Job::new_async(cron, move |_uuid, _lock| {
            let state = state.clone();
            let running = running.clone();
            let key = key.clone();
            let task = task.clone();
            Box::pin(async move {
                let Some(state) = state.upgrade() else { return };
                let Some(_guard) = RunningGuard::try_acquire(&running, &key) else {
                    tracing::warn!(timer = %key, "Skipping firing: previous run still in progress");
                    return;
                };
                let pool = state.workers.clone();
                pool.run_tracked(task(state)).await;
            })
        })?;
        Ok(job)
    }

    async fn add_resource_timer(&self, resource_id: &str, cron: &str) -> anyhow::Result<Uuid> {
        let rid = resource_id.to_string();
        let job = self.timer_job(cron, format!("resource:{resource_id}"), move |state| {
            let rid = rid.clone();
            async move { dispatch::run_scheduled_backup(&state, &rid).await }
        })?;
        let id = self.scheduler.lock().await.add(job).await?;
        Ok(id)
    }

    async fn remove_timer(&self, id: &Uuid) {
        if let Err(e) = self.scheduler.lock().await.remove(id).await {
            tracing::warn!(timer = %id, error = %e, "Failed to remove timer");
        }
    }

    /// Make the live per-resource timers match `resources`. Idempotent.
    pub async fn reconcile(&self, resources: &[Resource]) -> ReconcileReport {
        let mut desired: HashMap<&str, String> = HashMap::new();
        for r in resources {
            let Some(schedule) = r.active_schedule() else { continue };
            match validate_cron(schedule) {
                Ok(cron) => {
                    desired.insert(r.id.as_str(), cron);
                }
                Err(reason) => {
                    tracing::error!(resource_id = %r.id, cron = %schedule, %reason, "Invalid stored schedule, not scheduling")
                }
            }
        }

        let mut report = ReconcileReport::default();

        let stale: Vec<String> = self
            .timers
            .iter()
            .filter(|t| !desired.contains_key(t.key().as_str()))
            .map(|t| t.key().clone())
            .collect();
        for resource_id in stale {
            if let Some((_, timer)) = self.timers.remove(&resource_id) {
                self.remove_timer(&timer.id).await;
                tracing::info!(resource_id = %resource_id, "Timer removed");
                report.removed += 1;
            }
        }

        for (resource_id, cron) in desired {
            let current = self.timers.get(resource_id).map(|t| t.value().clone());
            if let Some(timer) = &current {
                if timer.cron == cron {
                    continue;
                }
            }
            let id = match self.add_resource_timer(resource_id, &cron).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!(resource_id = %resource_id, cron = %cron, error = %e, "Failed to schedule resource");
                    continue;
                }
            };
            if let Some(old) = current {
                self.remove_timer(&old.id).await;
                report.replaced += 1;
            } else {
                report.added += 1;
            }
            tracing::info!(resource_id = %resource_id, cron = %cron, "Resource scheduled");
            self.timers.insert(resource_id.to_string(), Timer { id, cron });
        }

        if report != ReconcileReport::default() {
            tracing::info!(added = report.added, replaced = report.replaced, removed = report.removed, "Timers reconciled");
        }
        report
    }

    /// Reconcile against the resources currently in the database.
    pub async fn refresh(&self) -> anyhow::Result<ReconcileReport> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Application state is gone"))?;
        let resources = with_conn(&state.db, |conn| resource::find_all(conn)).await?;
        Ok(self.reconcile(&resources).await)
    }

    async fn set_system_timer(&self, name: &'static str, job: Job, cron: &str) -> anyhow::Result<()> {
        let id = self.scheduler.lock().await.add(job).await?;
        if let Some(old) = self.system_timers.insert(name, Timer { id, cron: cron.to_string() }) {
            self.remove_timer(&old.id).await;
        }
        tracing::info!(timer = name, cron = %cron, "System timer scheduled");
        Ok(())
    }

    /// Retention sweep and disk metric refresh.
    pub async fn init_system_timers(&self, retention_cron: &str, disk_cron: &str) -> anyhow::Result<()> {
        let retention_cron = normalize_cron(retention_cron);
        let job = self.timer_job(&retention_cron, RETENTION_TIMER.into(), |state| async move {
            if let Err(e) = retention::sweep(&state).await {
                tracing::error!(error = %e, "Retention sweep failed");
            }
        })?;
        self.set_system_timer(RETENTION_TIMER, job, &retention_cron).await?;

        let disk_cron = normalize_cron(disk_cron);
        let job = self.timer_job(&disk_cron, DISK_TIMER.into(), |state| async move {
            disk::refresh_metric(&state.config.data_dir).await;
        })?;
        self.set_system_timer(DISK_TIMER, job, &disk_cron).await?;
        Ok(())
    }

    /// Register, replace or drop the packaging timer from the stored package configuration.
    pub async fn reload_package_schedule(&self) -> anyhow::Result<Option<String>> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Application state is gone"))?;
        let config = with_conn(&state.db, |conn| settings::package_config(conn)).await?;
        drop(state);

        let schedule = config
            .schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let Some(schedule) = schedule else {
            if let Some((_, old)) = self.system_timers.remove(PACKAGE_TIMER) {
                self.remove_timer(&old.id).await;
                tracing::info!("Package timer removed");
            }
            return Ok(None);
        };

        let cron = validate_cron(schedule)
            .map_err(|reason| anyhow::anyhow!("Invalid package schedule '{schedule}': {reason}"))?;
        if self.system_timers.get(PACKAGE_TIMER).is_some_and(|t| t.cron == cron) {
            return Ok(Some(cron));
        }
        let job = self.timer_job(&cron, PACKAGE_TIMER.into(), |state| async move {
            let format = match with_conn(&state.db, |conn| settings::package_config(conn)).await {
                Ok(config) => config.compression,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load package configuration");
                    return;
                }
            };
            // Outcome is logged and recorded in metrics by the packager
            let _ = packager::create_package(&state, format, TriggerOrigin::Scheduled).await;
        })?;
        self.set_system_timer(PACKAGE_TIMER, job, &cron).await?;
        Ok(Some(cron))
    }

    pub fn has_timer(&self, resource_id: &str) -> bool {
        self.timers.contains_key(resource_id)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn package_cron(&self) -> Option<String> {
        self.system_timers.get(PACKAGE_TIMER).map(|t| t.cron.clone())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
