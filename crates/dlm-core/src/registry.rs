//! Process-wide task registry: id allocation and shared task handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::task::{DownloadTask, TaskStatus};

/// Registry of task id -> task. Ids are allocated monotonically and never
/// reused within a process lifetime. Handles returned by [`get`](Self::get)
/// outlive the registry lock; removal cancels the task before dropping it.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<u64, Arc<DownloadTask>>>,
    next_id: AtomicU64,
    default_timeout_secs: u64,
}

impl TaskRegistry {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            default_timeout_secs,
        }
    }

    /// Allocates a fresh id and inserts a new task for `url` -> `output_path`.
    pub fn add(&self, url: &str, output_path: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = DownloadTask::new(url, output_path);
        task.set_timeout(self.default_timeout_secs);
        self.tasks.write().unwrap().insert(id, Arc::new(task));
        tracing::info!("added download task {}: {}", id, url);
        id
    }

    /// Cancels and drops the task. Returns false if the id is unknown.
    pub fn remove(&self, id: u64) -> bool {
        let removed = self.tasks.write().unwrap().remove(&id);
        match removed {
            Some(task) => {
                task.cancel();
                tracing::info!("removed task {}: {}", id, task.url());
                true
            }
            None => {
                tracing::warn!("attempt to remove unknown task {}", id);
                false
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<DownloadTask>> {
        self.tasks.read().unwrap().get(&id).cloned()
    }

    /// Unordered snapshot of the current ids.
    pub fn ids(&self) -> Vec<u64> {
        self.tasks.read().unwrap().keys().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    /// Tasks currently Downloading or Paused.
    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .unwrap()
            .values()
            .filter(|t| matches!(t.status(), TaskStatus::Downloading | TaskStatus::Paused))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let registry = TaskRegistry::new(30);
        let a = registry.add("http://example.test/a", "/tmp/a");
        let b = registry.add("http://example.test/b", "/tmp/b");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert!(registry.remove(a));
        let c = registry.add("http://example.test/c", "/tmp/c");
        assert_eq!(c, 2);
    }

    #[test]
    fn remove_cancels_the_task() {
        let registry = TaskRegistry::new(30);
        let id = registry.add("http://example.test/a", "/tmp/a");
        let handle = registry.get(id).unwrap();
        assert!(registry.remove(id));
        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert!(!registry.remove(id));
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn counts_and_snapshot() {
        let registry = TaskRegistry::new(30);
        assert_eq!(registry.count(), 0);
        registry.add("http://example.test/a", "/tmp/a");
        registry.add("http://example.test/b", "/tmp/b");
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.active_count(), 0);
        let mut ids = registry.ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
    }

}
