//! Download manager: the registry plus the pool, with the dispatch policy.
//!
//! `start`/`resume` block for the duration of a transfer, so they are handed
//! to the worker pool; `pause`/`cancel` only flip flags and run synchronously
//! on the calling thread. Bulk operations snapshot the id list once, outside
//! any lock, before dispatching.

use std::sync::Arc;

use crate::pool::WorkerPool;
use crate::registry::TaskRegistry;

pub struct DownloadManager {
    registry: Arc<TaskRegistry>,
    pool: Arc<WorkerPool>,
}

impl DownloadManager {
    pub fn new(registry: Arc<TaskRegistry>, pool: Arc<WorkerPool>) -> Self {
        Self { registry, pool }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn add_task(&self, url: &str, output_path: &str) -> u64 {
        self.registry.add(url, output_path)
    }

    /// Queues the task body on the pool. Returns false if the id is unknown;
    /// the download's own outcome is reported through the task's status.
    pub fn start_task(&self, id: u64) -> bool {
        let Some(task) = self.registry.get(id) else {
            tracing::warn!("attempt to start unknown task {}", id);
            return false;
        };
        tracing::info!("starting task {}: {}", id, task.url());
        self.pool.enqueue(move || {
            task.start();
        });
        true
    }

    pub fn pause_task(&self, id: u64) -> bool {
        let Some(task) = self.registry.get(id) else {
            tracing::warn!("attempt to pause unknown task {}", id);
            return false;
        };
        tracing::info!("pausing task {}: {}", id, task.url());
        task.pause()
    }

    /// Queues the resume on the pool; like start, it blocks while downloading.
    pub fn resume_task(&self, id: u64) -> bool {
        let Some(task) = self.registry.get(id) else {
            tracing::warn!("attempt to resume unknown task {}", id);
            return false;
        };
        tracing::info!("resuming task {}: {}", id, task.url());
        self.pool.enqueue(move || {
            task.resume();
        });
        true
    }

    pub fn cancel_task(&self, id: u64) -> bool {
        let Some(task) = self.registry.get(id) else {
            tracing::warn!("attempt to cancel unknown task {}", id);
            return false;
        };
        tracing::info!("cancelling task {}: {}", id, task.url());
        task.cancel()
    }

    pub fn start_all(&self) -> bool {
        tracing::info!("starting all tasks");
        for id in self.registry.ids() {
            self.start_task(id);
        }
        true
    }

    pub fn pause_all(&self) -> bool {
        tracing::info!("pausing all tasks");
        for id in self.registry.ids() {
            self.pause_task(id);
        }
        true
    }

    pub fn resume_all(&self) -> bool {
        tracing::info!("resuming all tasks");
        for id in self.registry.ids() {
            self.resume_task(id);
        }
        true
    }

    pub fn cancel_all(&self) -> bool {
        tracing::info!("cancelling all tasks");
        for id in self.registry.ids() {
            self.cancel_task(id);
        }
        true
    }
}
