//! Deferred update coordinator - parks non-critical callbacks until idle.
//!
//! Slow follow-up work (cache rebuilds, config writes, segment regeneration)
//! must never run while the display is mid-motion. Tasks queue here with a
//! priority and are drained only when the shared `is_animating` flag is
//! clear:
//! 1. `enqueue()` from anywhere on the main thread
//! 2. `drain_if_idle()` once per idle tick executes everything queued
//!
//! Lower priority value runs earlier; FIFO within a priority. A failing task
//! is logged and skipped, it never blocks the rest of the queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{trace, warn};

type TaskFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct QueuedTask {
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    label: String,
    job: TaskFn,
}

// BinaryHeap is a max-heap: greatest = lowest priority value, then lowest
// sequence number (FIFO within a priority)
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

/// Priority queue of idle-only callbacks.
pub struct DeferredQueue {
    heap: BinaryHeap<QueuedTask>,
    seq: u64,
    /// Owned by the animation side (compositor/engine); read-only here
    animating: Arc<AtomicBool>,
}

impl DeferredQueue {
    pub fn new(animating: Arc<AtomicBool>) -> Self {
        Self { heap: BinaryHeap::new(), seq: 0, animating }
    }

    /// Shared animation gate (for tests and the engine).
    pub fn animating_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.animating)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queue a callback. Lower priority value = runs earlier.
    pub fn enqueue<F>(&mut self, priority: i32, label: &str, job: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.seq += 1;
        trace!("Deferred task '{}' queued (priority {})", label, priority);
        self.heap.push(QueuedTask {
            priority,
            seq: self.seq,
            enqueued_at: Instant::now(),
            label: label.to_string(),
            job: Box::new(job),
        });
    }

    /// Execute all queued tasks if nothing is animating. Returns the number
    /// of tasks run (0 while mid-motion).
    pub fn drain_if_idle(&mut self) -> usize {
        if self.animating.load(Ordering::Relaxed) {
            return 0;
        }
        let mut ran = 0;
        while let Some(task) = self.heap.pop() {
            let waited = task.enqueued_at.elapsed();
            trace!(
                "Running deferred task '{}' (waited {} ms)",
                task.label,
                waited.as_millis()
            );
            if let Err(e) = (task.job)() {
                warn!("Deferred task '{}' failed: {:#}", task.label, e);
            }
            ran += 1;
        }
        ran
    }
}
