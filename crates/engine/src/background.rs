//! Background snapshot scheduler.
//!
//! Runs `SnapshotCreator::create_snapshot` jobs on a fixed pool of worker
//! threads fed by a bounded FIFO queue. Submitting to a full queue fails
//! fast with `SchedulerError::Backpressure`; shutdown drains the queue
//! before joining the workers.

use parking_lot::Mutex as ParkingMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::pipeline::{CreateSnapshotRequest, SnapshotCreator, SnapshotOutcome};

/// Errors returned by `SnapshotScheduler`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The queue is at capacity
    #[error("snapshot scheduler queue is full ({depth} jobs)")]
    Backpressure {
        /// Queue depth at rejection
        depth: usize,
    },

    /// The scheduler no longer accepts jobs
    #[error("snapshot scheduler is shut down")]
    ShutDown,

    /// A worker thread could not be started
    #[error("failed to spawn snapshot worker: {0}")]
    Spawn(String),
}

/// Scheduler metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Number of jobs waiting in the queue.
    pub queue_depth: usize,
    /// Number of jobs currently being executed by workers.
    pub active_jobs: usize,
    /// Total number of jobs completed since scheduler creation.
    pub jobs_completed: u64,
    /// Number of worker threads.
    pub worker_count: usize,
}

/// Receives the outcome of one submitted job
#[derive(Debug)]
pub struct JobHandle {
    snapshot_id: String,
    outcome: mpsc::Receiver<SnapshotOutcome>,
}

impl JobHandle {
    /// Snapshot the job creates
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// Block until the job finishes
    ///
    /// Returns `None` if the job panicked.
    pub fn wait(self) -> Option<SnapshotOutcome> {
        self.outcome.recv().ok()
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<SnapshotOutcome> {
        self.outcome.recv_timeout(timeout).ok()
    }
}

struct Job {
    request: CreateSnapshotRequest,
    reply: mpsc::Sender<SnapshotOutcome>,
}

struct SchedulerInner {
    creator: Arc<SnapshotCreator>,
    queue: ParkingMutex<VecDeque<Job>>,
    work_ready: parking_lot::Condvar,
    drain_cond: parking_lot::Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    active_jobs: AtomicUsize,
    max_queue_depth: usize,
    jobs_completed: AtomicU64,
}

/// Fixed pool of snapshot workers.
///
/// Jobs run in submission order, one per worker at a time.
pub struct SnapshotScheduler {
    inner: Arc<SchedulerInner>,
    workers: ParkingMutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl SnapshotScheduler {
    /// Create a scheduler with `num_threads` workers.
    ///
    /// Workers are named `snapvault-snap-0`, `snapvault-snap-1`, etc.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Spawn` if a worker thread cannot be started; the
    /// workers started so far are stopped.
    pub fn new(
        creator: Arc<SnapshotCreator>,
        num_threads: usize,
        max_queue_depth: usize,
    ) -> Result<Self, SchedulerError> {
        let inner = Arc::new(SchedulerInner {
            creator,
            queue: ParkingMutex::new(VecDeque::new()),
            work_ready: parking_lot::Condvar::new(),
            drain_cond: parking_lot::Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            active_jobs: AtomicUsize::new(0),
            max_queue_depth,
            jobs_completed: AtomicU64::new(0),
        });

        let scheduler = Self {
            inner,
            workers: ParkingMutex::new(Vec::with_capacity(num_threads)),
            num_threads,
        };

        for i in 0..num_threads {
            let inner_clone = Arc::clone(&scheduler.inner);
            let spawned = std::thread::Builder::new()
                .name(format!("snapvault-snap-{}", i))
                .spawn(move || worker_loop(&inner_clone));
            match spawned {
                Ok(handle) => scheduler.workers.lock().push(handle),
                Err(e) => {
                    scheduler.shutdown();
                    return Err(SchedulerError::Spawn(e.to_string()));
                }
            }
        }

        debug!(
            target: "snapvault::scheduler",
            workers = num_threads,
            max_queue_depth,
            "Scheduler started"
        );
        Ok(scheduler)
    }

    /// Queue a snapshot creation.
    ///
    /// # Errors
    ///
    /// `Backpressure` if the queue is at capacity, `ShutDown` after
    /// `shutdown`.
    pub fn submit(&self, request: CreateSnapshotRequest) -> Result<JobHandle, SchedulerError> {
        // Workers have been joined after shutdown; the job would never run
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        let depth = self.inner.queue_depth.load(AtomicOrdering::Acquire);
        if depth >= self.inner.max_queue_depth {
            return Err(SchedulerError::Backpressure { depth });
        }

        let (reply, outcome) = mpsc::channel();
        let snapshot_id = request.snapshot_id.clone();
        {
            let mut queue = self.inner.queue.lock();
            queue.push_back(Job { request, reply });
            self.inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }

        self.inner.work_ready.notify_one();
        debug!(target: "snapvault::scheduler", snapshot_id = %snapshot_id, "Snapshot job queued");
        Ok(JobHandle {
            snapshot_id,
            outcome,
        })
    }

    /// Block until all queued and in-flight jobs have completed.
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0
            || self.inner.active_jobs.load(AtomicOrdering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Stop accepting jobs, run what is queued, and join the workers.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);

        // Notify under the queue lock so a worker between its shutdown
        // check and its wait cannot miss the wakeup.
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!(
            target: "snapvault::scheduler",
            jobs_completed = self.inner.jobs_completed.load(AtomicOrdering::Relaxed),
            "Scheduler shut down"
        );
    }

    /// Return a snapshot of scheduler metrics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            active_jobs: self.inner.active_jobs.load(AtomicOrdering::Relaxed),
            jobs_completed: self.inner.jobs_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for SnapshotScheduler {
    fn drop(&mut self) {
        if !self.workers.lock().is_empty() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for SnapshotScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotScheduler")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Decrements `active_jobs` and wakes drain waiters, even if a job panics.
struct ActiveJobGuard<'a> {
    inner: &'a SchedulerInner,
}

impl<'a> Drop for ActiveJobGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_jobs.fetch_sub(1, AtomicOrdering::Release);
        self.inner
            .jobs_completed
            .fetch_add(1, AtomicOrdering::Relaxed);

        // drain() checks its condition under the queue lock
        if prev_active == 1 && self.inner.queue_depth.load(AtomicOrdering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    inner.active_jobs.fetch_add(1, AtomicOrdering::Release);
                    break job;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveJobGuard { inner };

        let Job { request, reply } = job;
        let creator = &inner.creator;
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            creator.create_snapshot(&request)
        })) {
            Ok(outcome) => {
                // The submitter may have dropped its handle
                let _ = reply.send(outcome);
            }
            Err(e) => {
                error!(
                    target: "snapvault::scheduler",
                    snapshot_id = %request.snapshot_id,
                    "snapshot job panicked: {:?}",
                    e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                );
            }
        }
    }
}
