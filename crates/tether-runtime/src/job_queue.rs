//! Job queue: the only way back onto the owning thread.
//!
//! ## Contract
//!
//! - [`JobSender::enqueue`] may be called from any thread.
//! - Every job runs exactly once, on the owning thread, with no other script
//!   code running concurrently.
//! - Jobs run in the order they arrive on the channel. For jobs produced by
//!   concurrent workers that is *completion* order, not the order the work was
//!   started in. Two fetches started `a, b` may settle `b, a`.
//!
//! ## Error handling
//!
//! A job returning `Err` is logged and counted; a panicking job is recovered,
//! logged and counted. Neither stops the loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use tracing::{error, trace, warn};

use crate::error::{ScriptError, ScriptResult};
use crate::runtime::Runtime;

/// A unit of work that must run on the owning thread.
pub type Job = Box<dyn FnOnce(&Runtime) -> ScriptResult<()> + Send + 'static>;

/// Counters shared by every sender and the owning thread.
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct JobStats {
    /// Jobs accepted by the queue
    pub jobs_enqueued: AtomicU64,
    /// Jobs executed (successfully or not)
    pub jobs_completed: AtomicU64,
    /// Jobs that returned an error or panicked
    pub jobs_failed: AtomicU64,
    /// Jobs dropped because the owning side was gone
    pub jobs_dropped: AtomicU64,
}

impl JobStats {
    /// Get snapshot of current stats
    pub fn snapshot(&self) -> JobStatsSnapshot {
        JobStatsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_dropped: self.jobs_dropped.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of [`JobStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_dropped: u64,
}

impl JobStatsSnapshot {
    /// Jobs accepted but not yet executed.
    pub fn queued(&self) -> u64 {
        self.jobs_enqueued
            .saturating_sub(self.jobs_completed + self.jobs_dropped)
    }
}

/// Thread-safe submission handle. Cheap to clone.
#[derive(Clone)]
pub struct JobSender {
    tx: Sender<Job>,
    stats: Arc<JobStats>,
}

impl JobSender {
    /// Submit a job. Fire-and-forget: no timing is promised beyond "eventually,
    /// on the owning thread". If the runtime is gone the job is dropped.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce(&Runtime) -> ScriptResult<()> + Send + 'static,
    {
        self.enqueue_boxed(Box::new(job));
    }

    /// Submit an already boxed job.
    pub fn enqueue_boxed(&self, job: Job) {
        self.stats.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(job).is_err() {
            self.stats.jobs_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Job dropped: runtime is gone");
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<JobStats> {
        &self.stats
    }
}

/// Receiving side, held by the owning thread.
pub struct JobQueue {
    rx: Receiver<Job>,
    sender: JobSender,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            rx,
            sender: JobSender {
                tx,
                stats: Arc::new(JobStats::default()),
            },
        }
    }

    /// A new submission handle.
    pub fn sender(&self) -> JobSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> &Arc<JobStats> {
        &self.sender.stats
    }

    /// Take the next job without blocking.
    pub fn try_next(&self) -> Option<Job> {
        match self.rx.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next job.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Job> {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => Some(job),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Discard every queued job without running it.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped != 0 {
            self.stats()
                .jobs_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    /// Execute one job on the owning thread, recovering errors and panics.
    ///
    /// Returns the job's outcome for callers that want it; the loop ignores it.
    pub fn run_job(&self, runtime: &Runtime, job: Job) -> ScriptResult<()> {
        let stats = self.stats();
        let result = match catch_unwind(AssertUnwindSafe(|| job(runtime))) {
            Ok(result) => result,
            Err(panic) => {
                let err = ScriptError::from_panic("Job", panic);
                error!("{}", err);
                Err(err)
            }
        };

        stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = &result {
            stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "Job failed");
        }
        result
    }
}
