//! Microtask queue for `queueMicrotask` callbacks.
//!
//! ## Drain points
//!
//! The queue is drained by the runtime:
//!
//! 1. after every job taken from the [job queue](crate::job_queue)
//! 2. after a synchronous [`Runtime::poll`](crate::Runtime::poll)
//! 3. before the event loop decides whether it is idle
//!
//! ## Ordering guarantees
//!
//! - FIFO: first queued, first executed
//! - Microtasks queued during a drain run in the same drain
//!
//! ## Error handling
//!
//! Errors are logged and the drain continues; one failing microtask never jams
//! the queue.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

use crate::error::{ScriptError, ScriptResult};

/// Microtask callback type. Owning-thread only, so no `Send` bound.
pub type Microtask = Box<dyn FnOnce() -> ScriptResult<()>>;

/// Queue of microtasks
#[derive(Default)]
pub struct MicrotaskQueue {
    queue: RefCell<VecDeque<Microtask>>,
    draining: Cell<bool>,
}

impl MicrotaskQueue {
    /// Create new empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a microtask to the queue
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() -> ScriptResult<()> + 'static,
    {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    /// Take the next microtask
    pub fn dequeue(&self) -> Option<Microtask> {
        self.queue.borrow_mut().pop_front()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Clear all pending microtasks
    pub fn clear(&self) {
        self.queue.borrow_mut().clear();
    }

    /// Run microtasks until the queue is empty, logging errors but continuing to
    /// process the queue. Returns the number executed.
    ///
    /// Re-entrant calls (a microtask draining the queue) are no-ops; the outer
    /// drain picks up whatever was queued.
    pub fn drain(&self) -> usize {
        if self.draining.replace(true) {
            return 0;
        }
        let _reset = scopeguard::guard(&self.draining, |flag| flag.set(false));

        let mut ran = 0;
        while let Some(task) = self.dequeue() {
            let result = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(result) => result,
                Err(panic) => Err(ScriptError::from_panic("Microtask", panic)),
            };
            if let Err(err) = result {
                warn!(error = %err, "Microtask error");
            }
            ran += 1;
        }
        ran
    }
}
