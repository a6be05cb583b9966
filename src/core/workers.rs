//! Background pool for plugin data refresh (network fetch, parsing).
//!
//! Uses work-stealing deques so slow plugin updates never contend with each
//! other, and never with the render tick: the tick only ever enqueues.
//!
//! Epoch mechanism cancels stale jobs: bumping the epoch when the enabled
//! set is rebuilt makes queued updates for the old set evaporate at
//! execution time instead of running against plugins that left the
//! rotation.

use crossbeam::deque::{Injector, Worker};
use log::trace;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Work-stealing pool for plugin updates.
pub struct UpdatePool {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    epoch: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl UpdatePool {
    /// Spawn `num_threads` workers. Recommended: `num_cpus::get() * 3 / 4`,
    /// leaving headroom for the render tick.
    pub fn new(num_threads: usize) -> Self {
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut locals: Vec<Worker<Job>> = Vec::new();
        let mut stealers = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            locals.push(worker);
        }

        for (worker_id, worker) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let handle = thread::Builder::new()
                .name(format!("marquee-update-{}", worker_id))
                .spawn(move || {
                    trace!("Update worker {} started", worker_id);
                    loop {
                        // Own queue first, then the injector, then steal
                        if let Some(job) = worker.pop() {
                            job();
                            continue;
                        }
                        if let Some(job) = injector.steal().success() {
                            job();
                            continue;
                        }
                        let mut found = false;
                        for stealer in &stealers {
                            if let Some(job) = stealer.steal().success() {
                                job();
                                found = true;
                                break;
                            }
                        }
                        if found {
                            continue;
                        }
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        // Idle: short sleep instead of spinning
                        thread::sleep(std::time::Duration::from_millis(1));
                    }
                    trace!("Update worker {} stopped", worker_id);
                })
                .expect("Failed to spawn update worker");

            handles.push(handle);
        }

        trace!("UpdatePool initialized: {} threads", num_threads);

        Self {
            injector,
            handles,
            epoch: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Invalidate everything queued so far (enabled-set rebuild).
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Run a job asynchronously on the pool.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }

    /// Run a job only if the epoch still matches at execution time. The
    /// check happens when a worker picks the job up, not at enqueue, which
    /// is what lets a rebuild cancel work already queued.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current = Arc::clone(&self.epoch);
        self.injector.push(Box::new(move || {
            if current.load(Ordering::Relaxed) == epoch {
                f();
            }
            // Stale epoch: silently skipped
        }));
    }
}

impl Drop for UpdatePool {
    fn drop(&mut self) {
        use std::time::{Duration, Instant};

        let num_threads = self.handles.len();
        trace!("UpdatePool shutting down ({} threads)...", num_threads);
        self.shutdown.store(true, Ordering::SeqCst);

        // Bounded wait; anything still running dies with the process
        let deadline = Instant::now() + Duration::from_millis(500);
        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("UpdatePool shutdown timeout, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        trace!("All {} update workers stopped", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn wait_for(counter: &AtomicU32, target: u32) -> bool {
        for _ in 0..500 {
            if counter.load(Ordering::SeqCst) >= target {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_jobs_execute() {
        let pool = UpdatePool::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let c = Arc::clone(&counter);
            pool.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_for(&counter, 8));
    }

    #[test]
    fn test_stale_epoch_jobs_skipped() {
        let pool = UpdatePool::new(1);
        let counter = Arc::new(AtomicU32::new(0));

        // Park the single worker so the epoch can change while jobs queue
        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        pool.execute(move || {
            while !g.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        });

        let epoch = pool.current_epoch();
        let c = Arc::clone(&counter);
        pool.execute_with_epoch(epoch, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&counter);
        pool.execute_with_epoch(epoch + 1, move || {
            c.fetch_add(10, Ordering::SeqCst);
        });

        pool.bump_epoch(); // invalidates `epoch`, validates `epoch + 1`
        gate.store(true, Ordering::SeqCst);

        assert!(wait_for(&counter, 10));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
