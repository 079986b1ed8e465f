use dashmap::DashMap;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio_util::task::TaskTracker;

/// Bounded pool for fired timers and API-triggered jobs.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Queue `fut` on the pool and return immediately.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pool = self.clone();
        self.tracker.spawn(async move {
            pool.run(fut).await;
        });
    }

    /// Run `fut` once a permit is free. A panic is logged and yields `None`.
    pub async fn run<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!("Worker pool closed, dropping task");
                return None;
            }
        };
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(output) => Some(output),
            Err(panic) => {
                let msg = panic_message(&panic);
                tracing::error!(panic = %msg, "Worker task panicked");
                None
            }
        }
    }

    /// Like [`run`](Self::run) for callers on their own task, such as fired
    /// timers. The future counts as in flight for [`drain`](Self::drain).
    pub async fn run_tracked<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        self.tracker.track_future(self.run(fut)).await
    }

    /// Stop accepting tasks and wait for in-flight ones to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        tracing::info!(in_flight = self.tracker.len(), "Draining worker pool");
        self.tracker.wait().await;
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

pub fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One advisory lock per resource id; pipeline runs for a resource are serialized.
#[derive(Default)]
pub struct ResourceLocks {
    inner: DashMap<String, Arc<Mutex<()>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, resource_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn forget(&self, resource_id: &str) {
        self.inner.remove(resource_id);
    }
}
