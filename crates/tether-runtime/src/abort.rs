//! Abort contexts, signals and controllers.
//!
//! Cancellation is split in two halves:
//!
//! - [`AbortContext`] is `Send + Sync`. Workers hold it and observe it from
//!   blocking calls (`cancelled().await`, [`AbortContext::run_until_aborted`]).
//!   The abort flag and reason live in a `OnceLock`, so the first abort wins no
//!   matter which thread performs it.
//! - [`AbortSignal`] is the owning-thread object scripts see. It adds the
//!   `abort` event, resource cleanups and the registry bookkeeping the runtime
//!   needs on dispose.
//!
//! An abort that starts off-thread (a deadline, a parent context) flips the
//! context immediately and reaches the signal through the job queue.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak as ArcWeak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{ScriptError, ScriptResult};
use crate::event::{Event, EventInit};
use crate::event_target::EventTarget;
use crate::runtime::Runtime;
use crate::value::Value;

/// Default message of a plain abort.
pub const ABORT_MESSAGE: &str = "This operation was aborted";
/// Message of a deadline abort.
pub const TIMEOUT_MESSAGE: &str = "The operation timed out";

/// Largest delay accepted by [`AbortSignal::timeout`].
const MAX_TIMEOUT_MS: f64 = 2_147_483_647.0;

/// Why a context was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// Explicit `abort()` call
    Aborted,
    /// A deadline elapsed
    TimedOut,
}

/// Abort reason, fixed by the first abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason {
    kind: AbortKind,
    message: String,
}

impl AbortReason {
    pub fn new(kind: AbortKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Explicit abort, with the default message when none is given.
    pub fn aborted(message: Option<&str>) -> Self {
        Self::new(AbortKind::Aborted, message.unwrap_or(ABORT_MESSAGE))
    }

    /// Deadline abort.
    pub fn timed_out() -> Self {
        Self::new(AbortKind::TimedOut, TIMEOUT_MESSAGE)
    }

    pub fn kind(&self) -> AbortKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

type AfterAbort = Box<dyn FnOnce(&AbortReason) + Send>;

struct ContextInner {
    reason: OnceLock<AbortReason>,
    aborted_tx: watch::Sender<bool>,
    after_abort: Mutex<Vec<(u64, AfterAbort)>>,
    next_callback_id: AtomicU64,
    /// Callbacks this context holds on its inputs (`child`, `any`)
    links: Mutex<Vec<AfterAbortHandle>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        for link in self.links.get_mut().drain(..) {
            link.stop();
        }
    }
}

/// Thread-safe cancellation source.
///
/// Cloning shares the same context.
#[derive(Clone)]
pub struct AbortContext {
    inner: Arc<ContextInner>,
}

impl Default for AbortContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortContext")
            .field("reason", &self.inner.reason.get())
            .finish()
    }
}

impl AbortContext {
    pub fn new() -> Self {
        let (aborted_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                reason: OnceLock::new(),
                aborted_tx,
                after_abort: Mutex::new(Vec::new()),
                next_callback_id: AtomicU64::new(1),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Abort the context. Returns `false` if it was already aborted; the first
    /// reason is kept.
    ///
    /// Wakes every `cancelled()` waiter and runs after-abort callbacks on the
    /// calling thread.
    pub fn abort(&self, reason: AbortReason) -> bool {
        if self.inner.reason.set(reason).is_err() {
            return false;
        }
        self.inner.aborted_tx.send_replace(true);

        let links = std::mem::take(&mut *self.inner.links.lock());
        for link in links {
            link.stop();
        }

        let callbacks = std::mem::take(&mut *self.inner.after_abort.lock());
        if let Some(reason) = self.inner.reason.get() {
            for (_, callback) in callbacks {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(reason))) {
                    error!("{}", ScriptError::from_panic("After-abort callback", panic));
                }
            }
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.get().cloned()
    }

    /// Resolves once the context is aborted, with the reason.
    pub async fn cancelled(&self) -> AbortReason {
        let mut rx = self.inner.aborted_tx.subscribe();
        // The sender lives as long as `self`, so this only returns on abort.
        let _ = rx.wait_for(|aborted| *aborted).await;
        self.reason().unwrap_or_else(|| AbortReason::aborted(None))
    }

    /// Run `callback` once the context is aborted, on the aborting thread.
    /// Runs immediately if the context is already aborted.
    pub fn after_abort<F>(&self, callback: F) -> AfterAbortHandle
    where
        F: FnOnce(&AbortReason) + Send + 'static,
    {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.after_abort.lock();
            // Checked under the lock: `abort` publishes the reason before taking the list.
            if self.inner.reason.get().is_none() {
                callbacks.push((id, Box::new(callback)));
                return AfterAbortHandle {
                    context: Arc::downgrade(&self.inner),
                    id,
                };
            }
        }
        if let Some(reason) = self.inner.reason.get() {
            callback(reason);
        }
        AfterAbortHandle {
            context: ArcWeak::new(),
            id,
        }
    }

    /// A context aborted whenever this one is, with the same reason. The child
    /// can also be aborted on its own without affecting the parent.
    ///
    /// The parent only keeps the child's callback while the child is alive and
    /// not aborted.
    pub fn child(&self) -> AbortContext {
        let child = AbortContext::new();
        child.follow(self);
        child
    }

    /// A context aborted as soon as any input is, with that input's reason.
    pub fn any(contexts: &[AbortContext]) -> AbortContext {
        let combined = AbortContext::new();
        if let Some(reason) = contexts.iter().find_map(|ctx| ctx.reason()) {
            combined.abort(reason);
            return combined;
        }
        for ctx in contexts {
            combined.follow(ctx);
        }
        combined
    }

    /// Abort with `input`'s reason when it aborts.
    fn follow(&self, input: &AbortContext) {
        let weak = Arc::downgrade(&self.inner);
        let handle = input.after_abort(move |reason| {
            if let Some(inner) = weak.upgrade() {
                AbortContext { inner }.abort(reason.clone());
            }
        });
        {
            let mut links = self.inner.links.lock();
            // Checked under the lock: `abort` publishes the reason before taking the links.
            if !self.is_aborted() {
                links.push(handle);
                return;
            }
        }
        handle.stop();
    }

    /// Abort with a timeout reason after `delay`, using a task on `handle`.
    /// The task exits early if the context is aborted first.
    pub fn abort_after(&self, handle: &Handle, delay: Duration) {
        let ctx = self.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if ctx.abort(AbortReason::timed_out()) {
                        debug!(delay_ms = delay.as_millis() as u64, "Abort deadline elapsed");
                    }
                }
                _ = ctx.cancelled() => {}
            }
        });
    }

    /// Drive `future` until it finishes or the context is aborted.
    pub async fn run_until_aborted<F>(&self, future: F) -> Result<F::Output, AbortReason>
    where
        F: Future,
    {
        if let Some(reason) = self.reason() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(reason),
            output = future => Ok(output),
        }
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &AbortContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Registration returned by [`AbortContext::after_abort`].
#[derive(Debug)]
pub struct AfterAbortHandle {
    context: ArcWeak<ContextInner>,
    id: u64,
}

impl AfterAbortHandle {
    /// Unregister the callback. Returns `false` if it already ran or the
    /// context is gone.
    pub fn stop(self) -> bool {
        let Some(inner) = self.context.upgrade() else {
            return false;
        };
        let mut callbacks = inner.after_abort.lock();
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != self.id);
        callbacks.len() != before
    }
}

type Cleanup = Box<dyn FnOnce(&AbortReason)>;

pub(crate) struct SignalInner {
    id: u64,
    context: AbortContext,
    target: EventTarget,
    notified: Cell<bool>,
    cleanups: RefCell<Vec<(u64, Cleanup)>>,
    next_cleanup_id: Cell<u64>,
    /// Cleanups this signal holds on its inputs (`any`)
    links: RefCell<Vec<OnAbortHandle>>,
}

impl Drop for SignalInner {
    fn drop(&mut self) {
        for link in self.links.get_mut().drain(..) {
            link.remove();
        }
    }
}

/// Registration returned by [`AbortSignal::on_abort`].
#[derive(Debug)]
pub struct OnAbortHandle {
    signal: Weak<SignalInner>,
    id: u64,
}

impl OnAbortHandle {
    /// Unregister the cleanup. Returns `false` if it already ran or the
    /// signal is gone.
    pub fn remove(self) -> bool {
        let Some(inner) = self.signal.upgrade() else {
            return false;
        };
        let removed = {
            let mut cleanups = inner.cleanups.borrow_mut();
            cleanups
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|index| cleanups.remove(index))
        };
        // Dropped outside the borrow: the cleanup may own other signals.
        removed.is_some()
    }
}

/// Script-visible abort signal.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<SignalInner>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("id", &self.inner.id)
            .field("aborted", &self.aborted())
            .finish()
    }
}

impl PartialEq for AbortSignal {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl AbortSignal {
    fn with_context(rt: &Runtime, context: AbortContext) -> Self {
        let registry = rt.signals();
        let id = registry.next_id();
        let inner = Rc::new(SignalInner {
            id,
            context: context.clone(),
            target: rt.event_target(),
            notified: Cell::new(false),
            cleanups: RefCell::new(Vec::new()),
            next_cleanup_id: Cell::new(1),
            links: RefCell::new(Vec::new()),
        });
        registry.insert(id, &inner);

        let sender = rt.sender();
        context.after_abort(move |_| {
            sender.enqueue(move |rt| {
                rt.signals().finish(id);
                Ok(())
            });
        });

        let signal = Self { inner };
        if context.is_aborted() {
            signal.notify();
        }
        signal
    }

    /// A signal that is already aborted.
    pub fn already_aborted(rt: &Runtime, reason: Option<&str>) -> Self {
        let context = AbortContext::new();
        context.abort(AbortReason::aborted(reason));
        Self::with_context(rt, context)
    }

    /// A signal that aborts with a timeout reason after `ms` milliseconds.
    ///
    /// `ms <= 0` aborts before returning.
    pub fn timeout(rt: &Runtime, ms: f64) -> Self {
        let context = AbortContext::new();
        if ms.is_nan() || ms <= 0.0 {
            context.abort(AbortReason::timed_out());
        } else {
            let delay = Duration::from_millis(ms.min(MAX_TIMEOUT_MS) as u64);
            context.abort_after(rt.handle(), delay);
        }
        Self::with_context(rt, context)
    }

    /// A signal that aborts when any of `signals` aborts, with that signal's
    /// reason.
    pub fn any(rt: &Runtime, signals: &[AbortSignal]) -> Self {
        let contexts: Vec<AbortContext> = signals.iter().map(|s| s.context()).collect();
        let combined = Self::with_context(rt, AbortContext::any(&contexts));
        if combined.aborted() {
            return combined;
        }
        for signal in signals {
            let weak = Rc::downgrade(&combined.inner);
            let handle = signal.on_abort(move |_| {
                if let Some(inner) = weak.upgrade() {
                    AbortSignal { inner }.notify();
                }
            });
            if combined.inner.notified.get() {
                handle.remove();
            } else {
                combined.inner.links.borrow_mut().push(handle);
            }
        }
        combined
    }

    /// Extract a signal from a script value.
    pub fn from_value(value: &Value) -> ScriptResult<Self> {
        value.downcast_ref::<AbortSignal>().cloned().ok_or_else(|| {
            ScriptError::Contract(format!(
                "parameter 'signal' is not of type 'AbortSignal', got {}",
                value.type_of()
            ))
        })
    }

    pub fn to_value(&self) -> Value {
        Value::object(self.clone())
    }

    /// The cancellation context to thread through blocking calls.
    pub fn context(&self) -> AbortContext {
        self.inner.context.clone()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn aborted(&self) -> bool {
        self.inner.context.is_aborted()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.context.reason()
    }

    /// Abort with an explicit reason. Only the first abort has any effect.
    pub fn abort(&self, reason: Option<&str>) {
        self.abort_with(AbortReason::aborted(reason));
    }

    pub(crate) fn abort_with(&self, reason: AbortReason) {
        self.inner.context.abort(reason);
        self.notify();
    }

    /// Return the abort error if the signal is aborted.
    pub fn throw_if_aborted(&self) -> ScriptResult<()> {
        match self.reason() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    /// Event target receiving the `abort` event.
    pub fn target(&self) -> &EventTarget {
        &self.inner.target
    }

    /// Register a cleanup that releases a resource when the signal aborts.
    /// Runs immediately if the abort was already delivered.
    ///
    /// Keep the handle to unregister the cleanup once the resource is released
    /// some other way.
    pub fn on_abort<F>(&self, cleanup: F) -> OnAbortHandle
    where
        F: FnOnce(&AbortReason) + 'static,
    {
        let id = self.inner.next_cleanup_id.get();
        self.inner.next_cleanup_id.set(id + 1);
        if self.inner.notified.get() {
            let reason = self.reason().unwrap_or_else(|| AbortReason::aborted(None));
            cleanup(&reason);
            return OnAbortHandle {
                signal: Weak::new(),
                id,
            };
        }
        self.inner.cleanups.borrow_mut().push((id, Box::new(cleanup)));
        OnAbortHandle {
            signal: Rc::downgrade(&self.inner),
            id,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_cleanups(&self) -> usize {
        self.inner.cleanups.borrow().len()
    }

    /// Deliver the abort on the owning thread: run cleanups, then fire `abort`.
    fn notify(&self) {
        if self.inner.notified.replace(true) {
            return;
        }
        let reason = self.reason().unwrap_or_else(|| AbortReason::aborted(None));
        debug!(signal_id = self.inner.id, reason = %reason, "AbortSignal aborted");

        let links = std::mem::take(&mut *self.inner.links.borrow_mut());
        for link in links {
            link.remove();
        }

        let cleanups = std::mem::take(&mut *self.inner.cleanups.borrow_mut());
        for (_, cleanup) in cleanups {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cleanup(&reason))) {
                error!(
                    signal_id = self.inner.id,
                    "{}",
                    ScriptError::from_panic("Abort cleanup", panic)
                );
            }
        }

        let event = Event::new("abort", EventInit::default());
        if let Err(err) = self.inner.target.dispatch_event(&event) {
            warn!(signal_id = self.inner.id, error = %err, "Failed to dispatch abort event");
        }
    }
}

/// Owner of an [`AbortSignal`].
#[derive(Debug, Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new(rt: &Runtime) -> Self {
        Self {
            signal: AbortSignal::with_context(rt, AbortContext::new()),
        }
    }

    /// A controller whose signal also aborts when `parent` does.
    pub fn with_parent(rt: &Runtime, parent: &AbortContext) -> Self {
        Self {
            signal: AbortSignal::with_context(rt, parent.child()),
        }
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Same path as [`AbortSignal::abort`].
    pub fn abort(&self, reason: Option<&str>) {
        self.signal.abort(reason);
    }
}

/// Live signals of one runtime, keyed by id.
pub(crate) struct SignalRegistry {
    entries: RefCell<HashMap<u64, Weak<SignalInner>>>,
    next_id: Cell<u64>,
    prune_at: Cell<usize>,
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            prune_at: Cell::new(64),
        }
    }
}

impl SignalRegistry {
    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn insert(&self, id: u64, inner: &Rc<SignalInner>) {
        let mut entries = self.entries.borrow_mut();
        if entries.len() >= self.prune_at.get() {
            entries.retain(|_, weak| weak.strong_count() > 0);
            self.prune_at.set((entries.len() * 2).max(64));
        }
        entries.insert(id, Rc::downgrade(inner));
    }

    /// Deliver an off-thread abort to the signal, if it is still alive.
    pub(crate) fn finish(&self, id: u64) {
        let inner = self.entries.borrow_mut().remove(&id);
        if let Some(inner) = inner.and_then(|weak| weak.upgrade()) {
            AbortSignal { inner }.notify();
        }
    }

    /// Abort every live signal (runtime dispose).
    pub(crate) fn abort_all(&self, reason: &AbortReason) -> usize {
        let live: Vec<Rc<SignalInner>> = self
            .entries
            .borrow_mut()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        let count = live.len();
        for inner in live {
            AbortSignal { inner }.abort_with(reason.clone());
        }
        count
    }

    /// Signals that are alive and not yet aborted.
    pub(crate) fn live_count(&self) -> usize {
        self.entries
            .borrow()
            .values()
            .filter_map(|weak| weak.upgrade())
            .filter(|inner| !inner.notified.get())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_first_abort_wins() {
        let ctx = AbortContext::new();
        assert!(ctx.abort(AbortReason::aborted(Some("x"))));
        assert!(!ctx.abort(AbortReason::aborted(Some("y"))));
        assert_eq!(ctx.reason().unwrap().message(), "x");
    }

    #[test]
    fn test_after_abort_runs_once() {
        let ctx = AbortContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        ctx.after_abort(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ctx.abort(AbortReason::aborted(None));
        ctx.abort(AbortReason::aborted(None));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Registered after the fact: runs immediately.
        let counter = hits.clone();
        ctx.after_abort(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_after_abort_stop() {
        let ctx = AbortContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handle = ctx.after_abort(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.stop());
        ctx.abort(AbortReason::aborted(None));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = AbortContext::new();
        let child = parent.child();
        assert!(!child.is_aborted());
        parent.abort(AbortReason::aborted(Some("parent gone")));
        assert_eq!(child.reason().unwrap().message(), "parent gone");

        let parent = AbortContext::new();
        let child = parent.child();
        child.abort(AbortReason::aborted(None));
        assert!(!parent.is_aborted());
    }

    #[test]
    fn test_any_takes_first_reason() {
        let a = AbortContext::new();
        let b = AbortContext::new();
        let combined = AbortContext::any(&[a.clone(), b.clone()]);
        b.abort(AbortReason::timed_out());
        a.abort(AbortReason::aborted(Some("late")));
        assert_eq!(combined.reason().unwrap().kind(), AbortKind::TimedOut);
    }

    #[test]
    fn test_dropped_children_unregister_from_parent() {
        let parent = AbortContext::new();
        for _ in 0..10_000 {
            drop(parent.child());
        }
        assert_eq!(parent.inner.after_abort.lock().len(), 0);

        let child = parent.child();
        assert_eq!(parent.inner.after_abort.lock().len(), 1);
        child.abort(AbortReason::aborted(None));
        assert_eq!(parent.inner.after_abort.lock().len(), 0);
    }

    #[test]
    fn test_combined_context_unregisters_from_inputs() {
        let a = AbortContext::new();
        let b = AbortContext::new();
        for _ in 0..1_000 {
            drop(AbortContext::any(&[a.clone(), b.clone()]));
        }
        assert_eq!(a.inner.after_abort.lock().len(), 0);
        assert_eq!(b.inner.after_abort.lock().len(), 0);

        let combined = AbortContext::any(&[a.clone(), b.clone()]);
        a.abort(AbortReason::aborted(Some("a")));
        assert_eq!(combined.reason().unwrap().message(), "a");
        assert_eq!(b.inner.after_abort.lock().len(), 0);
    }

    #[test]
    fn test_dropped_any_signal_unregisters_cleanups() {
        let rt = Runtime::new().unwrap();
        let a = AbortController::new(&rt);
        let b = AbortController::new(&rt);
        let baseline = a.signal().context().inner.after_abort.lock().len();
        for _ in 0..1_000 {
            drop(AbortSignal::any(&rt, &[a.signal().clone(), b.signal().clone()]));
        }
        assert_eq!(a.signal().pending_cleanups(), 0);
        assert_eq!(b.signal().pending_cleanups(), 0);
        assert_eq!(a.signal().context().inner.after_abort.lock().len(), baseline);

        let combined = AbortSignal::any(&rt, &[a.signal().clone(), b.signal().clone()]);
        a.abort(None);
        assert!(combined.aborted());
        assert_eq!(b.signal().pending_cleanups(), 0);
    }

    #[test]
    fn test_on_abort_handle_removes_cleanup() {
        let rt = Runtime::new().unwrap();
        let controller = AbortController::new(&rt);
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let handle = controller.signal().on_abort(move |_| flag.set(true));
        assert!(handle.remove());
        controller.abort(None);
        assert!(!ran.get());

        // Registered after delivery: runs now, nothing left to remove.
        let flag = ran.clone();
        let late = controller.signal().on_abort(move |_| flag.set(true));
        assert!(ran.get());
        assert!(!late.remove());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let ctx = AbortContext::new();
        let waiter = ctx.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        ctx.abort(AbortReason::aborted(Some("wake")));
        let reason = task.await.unwrap();
        assert_eq!(reason.message(), "wake");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_aborted_with_deadline() {
        let ctx = AbortContext::new();
        ctx.abort_after(&Handle::current(), Duration::from_millis(50));
        let result = ctx
            .run_until_aborted(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(result.unwrap_err().kind(), AbortKind::TimedOut);
    }

    #[tokio::test]
    async fn test_run_until_aborted_completes() {
        let ctx = AbortContext::new();
        let result = ctx.run_until_aborted(async { 7 }).await;
        assert_eq!(result, Ok(7));
    }
}
