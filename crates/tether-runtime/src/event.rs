//! DOM-style `Event`.
//!
//! An event is a mutable per-dispatch record. The transient fields (target,
//! current target, phase) are cleared when a dispatch finishes, so the same
//! event can be dispatched again.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ScriptError, ScriptResult};
use crate::event_target::EventTarget;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventPhase {
    #[default]
    None = 0,
    Capturing = 1,
    AtTarget = 2,
    Bubbling = 3,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventInit {
    pub bubbles: bool,
    pub cancelable: bool,
}

struct EventInner {
    typ: String,
    bubbles: bool,
    cancelable: bool,

    target: RefCell<Option<EventTarget>>,
    current_target: RefCell<Option<EventTarget>>,
    phase: Cell<EventPhase>,

    // flags
    stop_propagation_flag: Cell<bool>,
    stop_immediate_propagation_flag: Cell<bool>,
    canceled_flag: Cell<bool>,
    in_passive_listener_flag: Cell<bool>,
    dispatch_flag: Cell<bool>,

    time_stamp: f64,
}

/// Shared handle to an event. Clones observe the same flags.
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.inner.typ)
            .field("phase", &self.inner.phase.get())
            .field("bubbles", &self.inner.bubbles)
            .field("cancelable", &self.inner.cancelable)
            .field("default_prevented", &self.inner.canceled_flag.get())
            .finish()
    }
}

impl Event {
    pub fn new(typ: impl Into<String>, init: EventInit) -> Self {
        let time_stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or_default();
        Self {
            inner: Rc::new(EventInner {
                typ: typ.into(),
                bubbles: init.bubbles,
                cancelable: init.cancelable,
                target: RefCell::new(None),
                current_target: RefCell::new(None),
                phase: Cell::new(EventPhase::None),
                stop_propagation_flag: Cell::new(false),
                stop_immediate_propagation_flag: Cell::new(false),
                canceled_flag: Cell::new(false),
                in_passive_listener_flag: Cell::new(false),
                dispatch_flag: Cell::new(false),
                time_stamp,
            }),
        }
    }

    /// Extract an event from a script value.
    pub fn from_value(value: &Value) -> ScriptResult<Self> {
        value
            .downcast_ref::<Event>()
            .cloned()
            .ok_or_else(|| ScriptError::type_error("Event", value.type_of()))
    }

    pub fn to_value(&self) -> Value {
        Value::object(self.clone())
    }

    pub fn event_type(&self) -> &str {
        &self.inner.typ
    }

    pub fn bubbles(&self) -> bool {
        self.inner.bubbles
    }

    pub fn cancelable(&self) -> bool {
        self.inner.cancelable
    }

    pub fn target(&self) -> Option<EventTarget> {
        self.inner.target.borrow().clone()
    }

    pub fn current_target(&self) -> Option<EventTarget> {
        self.inner.current_target.borrow().clone()
    }

    pub fn event_phase(&self) -> EventPhase {
        self.inner.phase.get()
    }

    pub fn default_prevented(&self) -> bool {
        self.inner.canceled_flag.get()
    }

    /// Milliseconds since the Unix epoch at construction.
    pub fn time_stamp(&self) -> f64 {
        self.inner.time_stamp
    }

    /// Ignored for non-cancelable events and inside passive listeners.
    pub fn prevent_default(&self) {
        if self.inner.cancelable && !self.inner.in_passive_listener_flag.get() {
            self.inner.canceled_flag.set(true);
        }
    }

    /// Stop after the current target.
    pub fn stop_propagation(&self) {
        self.inner.stop_propagation_flag.set(true);
    }

    /// Stop after the current listener.
    pub fn stop_immediate_propagation(&self) {
        self.inner.stop_propagation_flag.set(true);
        self.inner.stop_immediate_propagation_flag.set(true);
    }

    pub fn is_dispatching(&self) -> bool {
        self.inner.dispatch_flag.get()
    }

    pub fn ptr_eq(&self, other: &Event) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn propagation_stopped(&self) -> bool {
        self.inner.stop_propagation_flag.get()
    }

    pub(crate) fn immediate_propagation_stopped(&self) -> bool {
        self.inner.stop_immediate_propagation_flag.get()
    }

    pub(crate) fn begin_dispatch(&self, target: &EventTarget) -> ScriptResult<()> {
        if self.inner.dispatch_flag.replace(true) {
            return Err(ScriptError::state("The event is already being dispatched"));
        }
        self.inner.stop_propagation_flag.set(false);
        self.inner.stop_immediate_propagation_flag.set(false);
        self.inner.canceled_flag.set(false);
        self.inner.in_passive_listener_flag.set(false);
        *self.inner.target.borrow_mut() = Some(target.clone());
        Ok(())
    }

    pub(crate) fn end_dispatch(&self) {
        self.inner.target.borrow_mut().take();
        self.inner.current_target.borrow_mut().take();
        self.inner.phase.set(EventPhase::None);
        self.inner.in_passive_listener_flag.set(false);
        self.inner.dispatch_flag.set(false);
    }

    pub(crate) fn set_phase(&self, phase: EventPhase) {
        self.inner.phase.set(phase);
    }

    pub(crate) fn set_current_target(&self, target: Option<&EventTarget>) {
        *self.inner.current_target.borrow_mut() = target.cloned();
    }

    pub(crate) fn set_in_passive_listener(&self, passive: bool) {
        self.inner.in_passive_listener_flag.set(passive);
    }
}
