//! Promise implementation
//!
//! Script-visible promises live on the owning thread only (`Rc` state). Worker
//! threads never touch them: the promise bridge in [`Runtime`](crate::Runtime)
//! parks the [`PromiseResolver`] in a pending table and settles it from a job.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::ScriptError;

/// Promise state
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState<T> {
    /// Not yet settled
    Pending,
    /// Resolved with value
    Fulfilled(T),
    /// Rejected with error
    Rejected(ScriptError),
}

/// Callback list type alias
type CallbackList<T> = RefCell<Vec<Box<dyn FnOnce(T)>>>;

struct PromiseInner<T> {
    state: RefCell<PromiseState<T>>,
    settled: Cell<bool>,
    on_fulfilled: CallbackList<T>,
    on_rejected: CallbackList<ScriptError>,
}

/// A script-visible promise.
pub struct Promise<T> {
    inner: Rc<PromiseInner<T>>,
}

/// The settling half of a promise. First settlement wins; later calls are no-ops.
pub struct PromiseResolver<T> {
    inner: Rc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for PromiseResolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Create a pending promise and its resolver.
    pub fn pending() -> (Self, PromiseResolver<T>) {
        let inner = Rc::new(PromiseInner {
            state: RefCell::new(PromiseState::Pending),
            settled: Cell::new(false),
            on_fulfilled: RefCell::new(Vec::new()),
            on_rejected: RefCell::new(Vec::new()),
        });
        (
            Self {
                inner: inner.clone(),
            },
            PromiseResolver { inner },
        )
    }

    /// Create an already-fulfilled promise.
    pub fn resolved(value: T) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.resolve(value);
        promise
    }

    /// Create an already-rejected promise.
    pub fn rejected(error: ScriptError) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.reject(error);
        promise
    }

    /// Register fulfillment callback
    pub fn then<F>(&self, callback: F)
    where
        F: FnOnce(T) + 'static,
    {
        let state = self.inner.state.borrow().clone();
        match state {
            PromiseState::Fulfilled(value) => callback(value),
            PromiseState::Pending => self.inner.on_fulfilled.borrow_mut().push(Box::new(callback)),
            PromiseState::Rejected(_) => {}
        }
    }

    /// Register rejection callback
    pub fn catch<F>(&self, callback: F)
    where
        F: FnOnce(ScriptError) + 'static,
    {
        let state = self.inner.state.borrow().clone();
        match state {
            PromiseState::Rejected(error) => callback(error),
            PromiseState::Pending => self.inner.on_rejected.borrow_mut().push(Box::new(callback)),
            PromiseState::Fulfilled(_) => {}
        }
    }

    /// Register a callback for either outcome.
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(Result<T, ScriptError>) + 'static,
    {
        let shared = Rc::new(RefCell::new(Some(callback)));
        let on_error = shared.clone();
        self.then(move |value| {
            if let Some(cb) = shared.borrow_mut().take() {
                cb(Ok(value));
            }
        });
        self.catch(move |error| {
            if let Some(cb) = on_error.borrow_mut().take() {
                cb(Err(error));
            }
        });
    }

    /// Get current state
    pub fn state(&self) -> PromiseState<T> {
        self.inner.state.borrow().clone()
    }

    /// The outcome, if settled.
    pub fn result(&self) -> Option<Result<T, ScriptError>> {
        match self.state() {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Ok(value)),
            PromiseState::Rejected(error) => Some(Err(error)),
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.inner.settled.get()
    }
}

impl<T: Clone + 'static> PromiseResolver<T> {
    /// Resolve the promise. Returns false if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        if self.inner.settled.replace(true) {
            return false;
        }
        *self.inner.state.borrow_mut() = PromiseState::Fulfilled(value.clone());
        self.inner.on_rejected.borrow_mut().clear();

        // Callbacks may register further reactions; never hold the borrow across them.
        let callbacks = std::mem::take(&mut *self.inner.on_fulfilled.borrow_mut());
        for callback in callbacks {
            callback(value.clone());
        }
        true
    }

    /// Reject the promise. Returns false if it was already settled.
    pub fn reject(&self, error: ScriptError) -> bool {
        if self.inner.settled.replace(true) {
            return false;
        }
        *self.inner.state.borrow_mut() = PromiseState::Rejected(error.clone());
        self.inner.on_fulfilled.borrow_mut().clear();

        let callbacks = std::mem::take(&mut *self.inner.on_rejected.borrow_mut());
        for callback in callbacks {
            callback(error.clone());
        }
        true
    }

    /// Settle from a result.
    pub fn settle(&self, result: Result<T, ScriptError>) -> bool {
        match result {
            Ok(value) => self.resolve(value),
            Err(error) => self.reject(error),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.get()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.borrow() {
            PromiseState::Pending => "pending",
            PromiseState::Fulfilled(_) => "fulfilled",
            PromiseState::Rejected(_) => "rejected",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

/// Type-erased resolver parked in the runtime's pending table while a worker
/// runs.
pub(crate) trait PendingSettle {
    /// Reject without knowing the value type (used on dispose).
    fn reject_erased(&self, error: ScriptError);

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Clone + 'static> PendingSettle for PromiseResolver<T> {
    fn reject_erased(&self, error: ScriptError) {
        self.reject(error);
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
