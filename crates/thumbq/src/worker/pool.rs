use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::queue::TaskQueue;
use crate::worker::task::TaskProcessor;

/// Fixed set of threads pulling tasks from the queue, one task at a time
/// each.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` workers. `poll_interval` bounds how long an idle
    /// worker sleeps before re-checking for delayed retries, expired leases
    /// and shutdown.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        processor: Arc<TaskProcessor>,
        worker_count: usize,
        poll_interval: Duration,
    ) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let processor = Arc::clone(&processor);
            let shutdown_flag = Arc::clone(&shutdown);

            let handle = thread::Builder::new()
                .name(format!("thumbq-worker-{}", worker_id))
                .spawn(move || {
                    run_worker(worker_id, queue, processor, shutdown_flag, poll_interval);
                });

            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("Failed to spawn worker {}: {}", worker_id, e),
            }
        }

        info!("Started {} workers", workers.len());

        Self { workers, shutdown }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn shutdown(&self) {
        info!("Stopping {} thumbnail workers", self.workers.len());
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Waits for every worker to finish its current task and exit. Call
    /// `shutdown` first.
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("Thumbnail workers stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn run_worker(
    worker_id: usize,
    queue: Arc<dyn TaskQueue>,
    processor: Arc<TaskProcessor>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    let name = format!("worker-{}", worker_id);
    debug!("Worker {} started", worker_id);

    let mut last_reclaim: Option<Instant> = None;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} saw shutdown flag", worker_id);
            break;
        }

        if last_reclaim.is_none_or(|t| t.elapsed() >= poll_interval) {
            last_reclaim = Some(Instant::now());
            match queue.reclaim_stalled(&name) {
                Ok(stalled) => {
                    for delivery in &stalled {
                        processor.finalize_stalled(delivery);
                    }
                }
                Err(e) => warn!("Worker {} failed to reclaim stalled tasks: {}", worker_id, e),
            }
        }

        match queue.dequeue(&name) {
            Ok(Some(delivery)) => {
                debug!(
                    "Worker {} processing task {} (attempt {})",
                    worker_id, delivery.task_id, delivery.attempt
                );
                processor.process(&delivery);
            }
            Ok(None) => queue.wait_for_work(poll_interval),
            Err(e) => {
                error!("Worker {} failed to dequeue: {}", worker_id, e);
                thread::sleep(poll_interval);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
