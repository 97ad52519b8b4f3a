//! Work-stealing worker pool: one FIFO queue per worker, submitter-affine
//! placement, random-victim stealing.
//!
//! Submissions hash the calling thread's id to pick a queue, so bursts from
//! one producer cluster on one queue and idle workers pull them over by
//! stealing. Each queue has its own mutex and condvar; no step ever holds
//! more than one queue lock, so stealing cannot deadlock. Do not collapse
//! this into a single shared queue: the per-queue locks are what keep the
//! submission fast path contention-free.

use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound on a park. A notify aimed at a busy worker's queue is lost, so
/// parked workers wake periodically and re-attempt a steal.
const STEAL_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct WorkerQueue {
    jobs: Mutex<VecDeque<Job>>,
    ready: Condvar,
}

pub struct WorkerPool {
    queues: Arc<Vec<WorkerQueue>>,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicUsize>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one), pinned to queues 0..size.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let queues: Arc<Vec<WorkerQueue>> =
            Arc::new((0..size).map(|_| WorkerQueue::default()).collect());
        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicUsize::new(0));

        let workers = (0..size)
            .map(|index| {
                let queues = Arc::clone(&queues);
                let stop = Arc::clone(&stop);
                let alive = Arc::clone(&alive);
                thread::spawn(move || {
                    alive.fetch_add(1, Ordering::SeqCst);
                    worker_loop(&queues, &stop, index);
                    alive.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        Self {
            queues,
            stop,
            alive,
            workers: Mutex::new(workers),
        }
    }

    /// Queues a unit of work on the submitter's home queue and wakes that
    /// worker. After [`shutdown`](Self::shutdown) the job is dropped.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        if self.stop.load(Ordering::Acquire) {
            tracing::warn!("enqueue after pool shutdown; job dropped");
            return;
        }
        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        let bucket = (hasher.finish() as usize) % self.queues.len();

        let queue = &self.queues[bucket];
        queue.jobs.lock().unwrap().push_back(Box::new(job));
        queue.ready.notify_one();
    }

    /// Sum of queue lengths, taken one per-queue lock at a time.
    pub fn pending(&self) -> usize {
        self.queues
            .iter()
            .map(|q| q.jobs.lock().unwrap().len())
            .sum()
    }

    /// Number of worker threads currently alive.
    pub fn active_threads(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stops and joins every worker. Workers finish their in-flight job;
    /// work still queued elsewhere is not guaranteed to run.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        for queue in self.queues.iter() {
            queue.ready.notify_all();
        }
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queues: &[WorkerQueue], stop: &AtomicBool, index: usize) {
    let mut rng = rand::thread_rng();

    while !stop.load(Ordering::Acquire) {
        // own queue first
        let mut job = queues[index].jobs.lock().unwrap().pop_front();

        // then one uniformly random victim
        if job.is_none() {
            let victim = rng.gen_range(0..queues.len());
            if victim != index {
                job = queues[victim].jobs.lock().unwrap().pop_front();
            }
        }

        match job {
            Some(job) => {
                // a failing job must not take the worker down with it
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("worker {}: job panicked", index);
                }
            }
            None => {
                let guard = queues[index].jobs.lock().unwrap();
                let _ = queues[index]
                    .ready
                    .wait_timeout_while(guard, STEAL_RETRY_INTERVAL, |jobs| {
                        jobs.is_empty() && !stop.load(Ordering::Acquire)
                    })
                    .unwrap();
            }
        }
    }
}
