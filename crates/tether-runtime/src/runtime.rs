//! The runtime host: owning-thread registries, worker pool and event loop.
//!
//! A [`Runtime`] is `!Send`. It lives on the owning thread together with every
//! script value, and it owns every per-instance registry:
//!
//! - the job queue (the way back from workers)
//! - the microtask queue
//! - the pending-promise table of the promise bridge
//! - the timer registry
//! - the abort signal registry
//!
//! Workers run on a tokio multi-thread pool, owned by the runtime or supplied
//! by the embedder through [`RuntimeBuilder::tokio_handle`]. They never touch
//! script values: results come back as jobs.
//!
//! # Example
//!
//! ```
//! use tether_runtime::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! let promise = rt.promise_blocking(|| Ok(21), |_, result| result.map(|n| n * 2));
//! assert_eq!(rt.block_on(&promise).unwrap(), 42);
//! ```

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::abort::{AbortReason, SignalRegistry};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult, ScriptError, ScriptResult};
use crate::event_target::EventTarget;
use crate::job_queue::{Job, JobQueue, JobSender, JobStatsSnapshot};
use crate::microtask::MicrotaskQueue;
use crate::promise::{PendingSettle, Promise, PromiseResolver};
use crate::timers::{TimerId, TimerKind, TimerRegistry, clamp_delay};
use crate::value::Value;

const DISPOSED_MESSAGE: &str = "Runtime has been disposed";

/// Builder for [`Runtime`]
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tether_runtime::RuntimeBuilder;
///
/// let rt = RuntimeBuilder::new()
///     .worker_threads(2)
///     .idle_poll(Duration::from_millis(5))
///     .build()
///     .unwrap();
/// assert_eq!(rt.config().worker_threads, 2);
/// ```
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    handle: Option<Handle>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads.max(1);
        self
    }

    pub fn idle_poll(mut self, interval: Duration) -> Self {
        self.config.idle_poll_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn stream_chunk_size(mut self, size: usize) -> Self {
        self.config.stream_chunk_size = size.max(1);
        self
    }

    pub fn max_dispatch_depth(mut self, depth: usize) -> Self {
        self.config.max_dispatch_depth = depth.max(1);
        self
    }

    /// Run workers on an existing tokio runtime instead of an owned pool.
    ///
    /// The runtime must have the time and IO drivers enabled.
    pub fn tokio_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> RuntimeResult<Runtime> {
        let (pool, handle) = match self.handle {
            Some(handle) => (None, handle),
            None => {
                let pool = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(self.config.worker_threads.max(1))
                    .thread_name("tether-worker")
                    .enable_all()
                    .build()?;
                let handle = pool.handle().clone();
                (Some(pool), handle)
            }
        };

        debug!(
            worker_threads = self.config.worker_threads,
            owned_pool = pool.is_some(),
            "Runtime created"
        );

        Ok(Runtime {
            config: self.config,
            handle,
            pool: RefCell::new(pool),
            jobs: JobQueue::new(),
            microtasks: MicrotaskQueue::new(),
            pending: RefCell::new(HashMap::new()),
            next_promise_id: Cell::new(1),
            inflight: Arc::new(AtomicU64::new(0)),
            timers: TimerRegistry::new(),
            signals: SignalRegistry::default(),
            http_client: OnceCell::new(),
            disposed: Cell::new(false),
        })
    }
}

/// Point-in-time runtime counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    pub jobs: JobStatsSnapshot,
    /// Bridge operations started and not yet settled on the owning thread
    pub inflight: u64,
    /// Bridge promises waiting for their settle job
    pub pending_promises: usize,
    pub active_timers: usize,
    /// Signals alive and not yet aborted
    pub live_signals: usize,
    pub queued_microtasks: usize,
}

/// Owning-thread runtime host.
pub struct Runtime {
    config: RuntimeConfig,
    handle: Handle,
    pool: RefCell<Option<tokio::runtime::Runtime>>,
    jobs: JobQueue,
    microtasks: MicrotaskQueue,
    pending: RefCell<HashMap<u64, Box<dyn PendingSettle>>>,
    next_promise_id: Cell<u64>,
    inflight: Arc<AtomicU64>,
    timers: TimerRegistry,
    signals: SignalRegistry,
    http_client: OnceCell<reqwest::Client>,
    disposed: Cell<bool>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("stats", &self.stats())
            .field("disposed", &self.disposed.get())
            .finish()
    }
}

impl Runtime {
    /// Runtime with the default configuration and an owned worker pool.
    pub fn new() -> RuntimeResult<Self> {
        RuntimeBuilder::new().build()
    }

    pub fn with_config(config: RuntimeConfig) -> RuntimeResult<Self> {
        RuntimeBuilder::new().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Handle of the worker pool.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// A thread-safe submission handle for the job queue.
    pub fn sender(&self) -> JobSender {
        self.jobs.sender()
    }

    /// Submit a job from the owning thread. It runs on a later loop turn.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce(&Runtime) -> ScriptResult<()> + Send + 'static,
    {
        self.jobs.sender().enqueue(job);
    }

    /// `queueMicrotask(callback)`: runs after the current job, before the
    /// next one.
    pub fn queue_microtask(&self, callback: &Value) -> ScriptResult<()> {
        let callback = callback.expect_function("The \"callback\" argument")?;
        self.microtasks.enqueue(move || callback.call(&[]).map(|_| ()));
        Ok(())
    }

    /// Queue a native microtask.
    pub fn queue_microtask_fn<F>(&self, task: F)
    where
        F: FnOnce() -> ScriptResult<()> + 'static,
    {
        self.microtasks.enqueue(task);
    }

    // ---------------------------------------------------------------------
    // Promise bridge
    // ---------------------------------------------------------------------

    /// Run `work` on a worker and settle the returned promise from a job.
    ///
    /// The promise is pending until the job runs, even if `work` finished long
    /// before. A panic in `work` or in `then` becomes a rejection.
    pub fn promise_new<T, U, W, F>(&self, work: W, then: F) -> Promise<U>
    where
        T: Send + 'static,
        U: Clone + 'static,
        W: Future<Output = ScriptResult<T>> + Send + 'static,
        F: FnOnce(&Runtime, ScriptResult<T>) -> ScriptResult<U> + Send + 'static,
    {
        let (promise, id) = self.park::<U>();
        let Some(id) = id else {
            return promise;
        };
        let complete = self.completion(id, then);
        self.handle.spawn(async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(ScriptError::from_panic("Worker", panic)),
            };
            complete(outcome);
        });
        promise
    }

    /// Like [`promise_new`](Self::promise_new) for synchronous blocking work,
    /// run on the blocking pool.
    pub fn promise_blocking<T, U, W, F>(&self, work: W, then: F) -> Promise<U>
    where
        T: Send + 'static,
        U: Clone + 'static,
        W: FnOnce() -> ScriptResult<T> + Send + 'static,
        F: FnOnce(&Runtime, ScriptResult<T>) -> ScriptResult<U> + Send + 'static,
    {
        let (promise, id) = self.park::<U>();
        let Some(id) = id else {
            return promise;
        };
        let complete = self.completion(id, then);
        self.handle.spawn_blocking(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(outcome) => outcome,
                Err(panic) => Err(ScriptError::from_panic("Worker", panic)),
            };
            complete(outcome);
        });
        promise
    }

    /// Create a pending promise and park its resolver. `None` after dispose,
    /// in which case the promise is already rejected.
    fn park<U: Clone + 'static>(&self) -> (Promise<U>, Option<u64>) {
        let (promise, resolver) = Promise::pending();
        if self.disposed.get() {
            resolver.reject(ScriptError::Abort(DISPOSED_MESSAGE.to_string()));
            return (promise, None);
        }
        let id = self.next_promise_id.get();
        self.next_promise_id.set(id + 1);
        self.pending.borrow_mut().insert(id, Box::new(resolver));
        trace!(promise_id = id, "Promise parked");
        (promise, Some(id))
    }

    /// The worker-side half of the bridge: hand the outcome back as a job.
    fn completion<T, U, F>(&self, id: u64, then: F) -> impl FnOnce(ScriptResult<T>) + Send + 'static
    where
        T: Send + 'static,
        U: Clone + 'static,
        F: FnOnce(&Runtime, ScriptResult<T>) -> ScriptResult<U> + Send + 'static,
    {
        let sender = self.jobs.sender();
        let inflight = self.inflight.clone();
        inflight.fetch_add(1, Ordering::SeqCst);
        move |outcome| {
            // In flight until the settle job runs on the owning thread.
            sender.enqueue(move |rt| {
                inflight.fetch_sub(1, Ordering::SeqCst);
                rt.settle_parked::<T, U, F>(id, outcome, then)
            });
        }
    }

    fn settle_parked<T, U, F>(&self, id: u64, outcome: ScriptResult<T>, then: F) -> ScriptResult<()>
    where
        U: Clone + 'static,
        F: FnOnce(&Runtime, ScriptResult<T>) -> ScriptResult<U>,
    {
        let parked = self.pending.borrow_mut().remove(&id);
        let Some(parked) = parked else {
            trace!(promise_id = id, "Promise settled elsewhere");
            return Ok(());
        };
        let resolver = parked
            .into_any()
            .downcast::<PromiseResolver<U>>()
            .map_err(|_| ScriptError::internal("promise resolver type mismatch"))?;

        let result = match catch_unwind(AssertUnwindSafe(|| then(self, outcome))) {
            Ok(result) => result,
            Err(panic) => Err(ScriptError::from_panic("Promise callback", panic)),
        };
        resolver.settle(result);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// `setTimeout(callback, delay, ...args)`
    pub fn set_timeout(&self, callback: &Value, delay: &Value, args: Vec<Value>) -> ScriptResult<TimerId> {
        self.schedule_timer(TimerKind::Timeout, callback, delay, args)
    }

    /// `setInterval(callback, delay, ...args)`
    pub fn set_interval(&self, callback: &Value, delay: &Value, args: Vec<Value>) -> ScriptResult<TimerId> {
        self.schedule_timer(TimerKind::Interval, callback, delay, args)
    }

    /// `clearTimeout(id)`. Unknown ids and repeated clears are no-ops.
    pub fn clear_timeout(&self, id: &Value) {
        if let Some(id) = TimerId::from_value(id) {
            self.timers.clear(id);
        }
    }

    /// `clearInterval(id)`. Shares the registry with timeouts.
    pub fn clear_interval(&self, id: &Value) {
        self.clear_timeout(id);
    }

    fn schedule_timer(
        &self,
        kind: TimerKind,
        callback: &Value,
        delay: &Value,
        args: Vec<Value>,
    ) -> ScriptResult<TimerId> {
        let callback = callback.expect_function("The \"callback\" argument")?;
        if self.disposed.get() {
            return Err(ScriptError::state(DISPOSED_MESSAGE));
        }
        Ok(self.timers.schedule(
            &self.handle,
            self.jobs.sender(),
            kind,
            callback,
            clamp_delay(delay),
            args,
        ))
    }

    // ---------------------------------------------------------------------
    // Host objects
    // ---------------------------------------------------------------------

    /// A new event target using the configured dispatch depth limit.
    pub fn event_target(&self) -> EventTarget {
        EventTarget::with_max_depth(self.config.max_dispatch_depth)
    }

    pub(crate) fn signals(&self) -> &SignalRegistry {
        &self.signals
    }

    /// Shared HTTP client, built on first use from the fetch configuration.
    pub(crate) fn http_client(&self) -> ScriptResult<reqwest::Client> {
        if let Some(client) = self.http_client.get() {
            return Ok(client.clone());
        }
        let fetch = &self.config.fetch;
        let client = reqwest::Client::builder()
            .user_agent(fetch.user_agent.clone())
            .connect_timeout(Duration::from_millis(fetch.connect_timeout_ms))
            .timeout(Duration::from_millis(fetch.request_timeout_ms))
            .pool_max_idle_per_host(fetch.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ScriptError::internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(self.http_client.get_or_init(|| client).clone())
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    /// True when nothing can produce more work: no queued jobs or microtasks,
    /// no bridge operations in flight and no active timers.
    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
            && self.microtasks.is_empty()
            && self.inflight.load(Ordering::SeqCst) == 0
            && self.timers.active_count() == 0
    }

    /// Run the jobs that are queued right now without waiting. Returns the
    /// number of jobs run.
    pub fn poll(&self) -> usize {
        self.microtasks.drain();
        let queued = self.jobs.len();
        let mut ran = 0;
        for _ in 0..queued {
            let Some(job) = self.jobs.try_next() else {
                break;
            };
            self.run_job(job);
            ran += 1;
        }
        ran
    }

    /// Run until idle. Never returns while an interval is active.
    pub fn run_until_idle(&self) -> RuntimeResult<()> {
        self.run_loop(None).map(|_| ())
    }

    /// Run until idle or until `timeout` elapses. Returns `true` if the loop
    /// went idle.
    pub fn run_until_idle_timeout(&self, timeout: Duration) -> RuntimeResult<bool> {
        self.run_loop(Some(Instant::now() + timeout))
    }

    /// Run the loop until `promise` settles.
    ///
    /// Fails if the loop goes idle first, since nothing could settle it then.
    pub fn block_on<T: Clone + 'static>(&self, promise: &Promise<T>) -> RuntimeResult<T> {
        loop {
            self.microtasks.drain();
            if let Some(result) = promise.result() {
                return result.map_err(RuntimeError::from);
            }
            self.ensure_live()?;
            if self.is_idle() {
                return Err(ScriptError::internal("promise can never settle: event loop is idle").into());
            }
            if let Some(job) = self.jobs.next_timeout(self.config.idle_poll()) {
                self.run_job(job);
            }
        }
    }

    fn run_loop(&self, deadline: Option<Instant>) -> RuntimeResult<bool> {
        self.ensure_live()?;
        let idle_poll = self.config.idle_poll();
        loop {
            self.microtasks.drain();
            if self.is_idle() {
                return Ok(true);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(idle_poll)
                }
                None => idle_poll,
            };
            if let Some(job) = self.jobs.next_timeout(wait) {
                self.run_job(job);
            }
        }
    }

    fn run_job(&self, job: Job) {
        // Failures are logged and counted by the queue; the loop keeps going.
        let _ = self.jobs.run_job(self, job);
        self.microtasks.drain();
    }

    fn ensure_live(&self) -> RuntimeResult<()> {
        if self.disposed.get() {
            Err(RuntimeError::Disposed)
        } else {
            Ok(())
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            jobs: self.jobs.stats().snapshot(),
            inflight: self.inflight.load(Ordering::SeqCst),
            pending_promises: self.pending.borrow().len(),
            active_timers: self.timers.active_count(),
            live_signals: self.signals.live_count(),
            queued_microtasks: self.microtasks.len(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Tear the runtime down: abort every signal, stop every timer, reject
    /// every pending bridge promise and stop the owned worker pool.
    /// Idempotent; also runs on drop.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let reason = AbortReason::aborted(Some(DISPOSED_MESSAGE));

        let signals = self.signals.abort_all(&reason);
        let timers = self.timers.clear_all();

        let pending: Vec<Box<dyn PendingSettle>> =
            self.pending.borrow_mut().drain().map(|(_, parked)| parked).collect();
        let rejected = pending.len();
        for parked in pending {
            parked.reject_erased(ScriptError::from(reason.clone()));
        }

        self.microtasks.clear();
        let dropped = self.jobs.clear();
        // Settle jobs dropped above can no longer run.
        self.inflight.store(0, Ordering::SeqCst);

        if let Some(pool) = self.pool.borrow_mut().take() {
            pool.shutdown_background();
        }

        debug!(signals, timers, rejected, dropped, "Runtime disposed");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.dispose();
    }
}
