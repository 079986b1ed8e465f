use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::services::backup_scheduler::BackupScheduler;
use crate::services::storage::StorageProvider;
use crate::services::workers::{ResourceLocks, WorkerPool};
use std::sync::Arc;
use tokio_cron_scheduler::JobScheduler;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub storage: Arc<dyn StorageProvider>,
    pub workers: WorkerPool,
    pub locks: ResourceLocks,
    pub scheduler: BackupScheduler,
}

impl AppState {
    /// The scheduler keeps a weak handle back to the state so fired timers
    /// can reach the pool and database without a reference cycle.
    pub async fn build(
        db: DbPool,
        config: AppConfig,
        storage: Arc<dyn StorageProvider>,
    ) -> anyhow::Result<Arc<Self>> {
        let cron = JobScheduler::new().await?;
        let workers = WorkerPool::new(config.worker_pool_size);
        Ok(Arc::new_cyclic(|weak| Self {
            db,
            config,
            storage,
            workers,
            locks: ResourceLocks::new(),
            scheduler: BackupScheduler::new(cron, weak.clone()),
        }))
    }
}
