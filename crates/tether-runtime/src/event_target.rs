//! `EventTarget` with capture, target and bubble dispatch.
//!
//! Targets form a tree through non-owning parent links. Whoever builds the
//! tree owns the nodes; a child never keeps its parent alive.
//!
//! ## Dispatch order
//!
//! 1. capture: ancestors from the root down to the parent, capture listeners
//! 2. target: every listener on the target, in registration order
//! 3. bubble (only if the event bubbles): parent up to the root, non-capture
//!    listeners
//!
//! `stop_propagation` ends the walk after the current target;
//! `stop_immediate_propagation` also skips the remaining listeners of the
//! current target.
//!
//! ## Errors
//!
//! A listener that returns an error or panics is logged; dispatch continues
//! with the next listener.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, warn};

use crate::abort::{AbortSignal, OnAbortHandle};
use crate::error::{ScriptError, ScriptResult};
use crate::event::{Event, EventPhase};
use crate::value::{ScriptFunction, Value};

/// Default limit on the number of ancestors walked per dispatch.
pub const DEFAULT_MAX_DISPATCH_DEPTH: usize = 1024;

static NEXT_NATIVE_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

type NativeHandler = dyn Fn(&Event) -> ScriptResult<()>;

/// A listener implemented in Rust. Identity is the id assigned at creation.
#[derive(Clone)]
pub struct NativeListener {
    id: u64,
    handler: Rc<NativeHandler>,
}

impl NativeListener {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Event) -> ScriptResult<()> + 'static,
    {
        Self {
            id: NEXT_NATIVE_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            handler: Rc::new(handler),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// An event listener.
#[derive(Clone)]
pub enum Listener {
    /// Script callable, compared by reference
    Script(ScriptFunction),
    /// Native handler, compared by id
    Native(NativeListener),
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script(func) => write!(f, "Listener::Script({:?})", func),
            Self::Native(native) => write!(f, "Listener::Native(#{})", native.id),
        }
    }
}

impl Listener {
    /// Wrap a script value; only callables are accepted.
    pub fn from_value(value: &Value) -> ScriptResult<Self> {
        value.expect_function("The \"listener\" argument").map(Self::Script)
    }

    pub fn native<F>(handler: F) -> Self
    where
        F: Fn(&Event) -> ScriptResult<()> + 'static,
    {
        Self::Native(NativeListener::new(handler))
    }

    pub fn handle_event(&self, event: &Event) -> ScriptResult<()> {
        match self {
            Self::Script(func) => func.call(&[event.to_value()]).map(|_| ()),
            Self::Native(native) => (native.handler)(event),
        }
    }

    pub fn equals(&self, other: &Listener) -> bool {
        match (self, other) {
            (Self::Script(a), Self::Script(b)) => a.ptr_eq(b),
            (Self::Native(a), Self::Native(b)) => a.id == b.id,
            _ => false,
        }
    }
}

/// Options accepted by [`EventTarget::add_event_listener`].
#[derive(Debug, Clone, Default)]
pub struct AddEventListenerOptions {
    pub capture: bool,
    pub once: bool,
    pub passive: bool,
    /// Remove the listener when this signal aborts.
    pub signal: Option<AbortSignal>,
}

impl AddEventListenerOptions {
    pub fn capture() -> Self {
        Self {
            capture: true,
            ..Self::default()
        }
    }

    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }
}

struct RegisteredListener {
    listener: Listener,
    capture: bool,
    once: bool,
    passive: bool,
    removed: Cell<bool>,
    /// Cleanup registered on the `signal` option
    on_abort: RefCell<Option<OnAbortHandle>>,
}

impl Drop for RegisteredListener {
    fn drop(&mut self) {
        if let Some(handle) = self.on_abort.get_mut().take() {
            handle.remove();
        }
    }
}

struct TargetInner {
    listeners: RefCell<HashMap<String, Vec<Rc<RegisteredListener>>>>,
    parent: RefCell<Weak<TargetInner>>,
    max_depth: usize,
}

/// Shared handle to an event target.
#[derive(Clone)]
pub struct EventTarget {
    inner: Rc<TargetInner>,
}

impl Default for EventTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners: usize = self.inner.listeners.borrow().values().map(Vec::len).sum();
        f.debug_struct("EventTarget")
            .field("listeners", &listeners)
            .field("has_parent", &self.parent().is_some())
            .finish()
    }
}

impl PartialEq for EventTarget {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl EventTarget {
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DISPATCH_DEPTH)
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            inner: Rc::new(TargetInner {
                listeners: RefCell::new(HashMap::new()),
                parent: RefCell::new(Weak::new()),
                max_depth: max_depth.max(1),
            }),
        }
    }

    pub fn from_value(value: &Value) -> ScriptResult<Self> {
        value
            .downcast_ref::<EventTarget>()
            .cloned()
            .ok_or_else(|| ScriptError::type_error("EventTarget", value.type_of()))
    }

    pub fn to_value(&self) -> Value {
        Value::object(self.clone())
    }

    pub fn ptr_eq(&self, other: &EventTarget) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Set the (non-owning) parent used for capture and bubbling.
    pub fn set_parent(&self, parent: Option<&EventTarget>) {
        *self.inner.parent.borrow_mut() = parent
            .map(|p| Rc::downgrade(&p.inner))
            .unwrap_or_default();
    }

    pub fn parent(&self) -> Option<EventTarget> {
        self.inner
            .parent
            .borrow()
            .upgrade()
            .map(|inner| EventTarget { inner })
    }

    /// Number of listeners registered for `typ`.
    pub fn listener_count(&self, typ: &str) -> usize {
        self.inner
            .listeners
            .borrow()
            .get(typ)
            .map_or(0, Vec::len)
    }

    pub fn add_event_listener(
        &self,
        typ: &str,
        listener: Listener,
        options: AddEventListenerOptions,
    ) {
        if let Some(signal) = &options.signal
            && signal.aborted()
        {
            return;
        }

        let reg = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let list = listeners.entry(typ.to_string()).or_default();
            if list
                .iter()
                .any(|reg| reg.capture == options.capture && reg.listener.equals(&listener))
            {
                return;
            }
            let reg = Rc::new(RegisteredListener {
                listener: listener.clone(),
                capture: options.capture,
                once: options.once,
                passive: options.passive,
                removed: Cell::new(false),
                on_abort: RefCell::new(None),
            });
            list.push(reg.clone());
            reg
        };

        // The registration owns the cleanup; removing the listener drops it.
        if let Some(signal) = options.signal {
            let target = Rc::downgrade(&self.inner);
            let typ = typ.to_string();
            let capture = options.capture;
            let handle = signal.on_abort(move |_| {
                if let Some(inner) = target.upgrade() {
                    EventTarget { inner }.remove_event_listener(&typ, &listener, capture);
                }
            });
            *reg.on_abort.borrow_mut() = Some(handle);
        }
    }

    /// Remove by identity and capture flag. Unknown listeners are ignored.
    pub fn remove_event_listener(&self, typ: &str, listener: &Listener, capture: bool) {
        let removed = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let Some(list) = listeners.get_mut(typ) else {
                return;
            };
            let Some(index) = list
                .iter()
                .position(|reg| reg.capture == capture && reg.listener.equals(listener))
            else {
                return;
            };
            let reg = list.remove(index);
            reg.removed.set(true);
            if list.is_empty() {
                listeners.remove(typ);
            }
            reg
        };
        // Released after the borrow ends; this may unregister a signal cleanup.
        drop(removed);
    }

    /// Dispatch `event` at this target. Returns `false` if a listener
    /// cancelled it.
    pub fn dispatch_event(&self, event: &Event) -> ScriptResult<bool> {
        event.begin_dispatch(self)?;
        let _reset = scopeguard::guard(event, |event| event.end_dispatch());

        let path = self.ancestors();

        event.set_phase(EventPhase::Capturing);
        for target in path.iter().rev() {
            if event.propagation_stopped() {
                break;
            }
            target.invoke_listeners(event, EventPhase::Capturing);
        }

        if !event.propagation_stopped() {
            event.set_phase(EventPhase::AtTarget);
            self.invoke_listeners(event, EventPhase::AtTarget);
        }

        if event.bubbles() {
            event.set_phase(EventPhase::Bubbling);
            for target in path.iter() {
                if event.propagation_stopped() {
                    break;
                }
                target.invoke_listeners(event, EventPhase::Bubbling);
            }
        }

        Ok(!event.default_prevented())
    }

    /// Parent chain, nearest first. Stops at a cycle or at the depth limit.
    fn ancestors(&self) -> Vec<EventTarget> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(Rc::as_ptr(&self.inner));

        let mut current = self.parent();
        while let Some(target) = current {
            if !visited.insert(Rc::as_ptr(&target.inner)) {
                warn!(depth = path.len(), "Event target parent chain has a cycle");
                break;
            }
            if path.len() >= self.inner.max_depth {
                warn!(
                    max_depth = self.inner.max_depth,
                    "Event target parent chain exceeds maximum depth"
                );
                break;
            }
            current = target.parent();
            path.push(target);
        }
        path
    }

    fn invoke_listeners(&self, event: &Event, phase: EventPhase) {
        let listeners = match self.inner.listeners.borrow().get(event.event_type()) {
            Some(list) => list.clone(),
            None => return,
        };
        event.set_current_target(Some(self));

        for reg in listeners {
            if reg.removed.get() {
                continue;
            }
            match phase {
                EventPhase::Capturing if !reg.capture => continue,
                EventPhase::Bubbling if reg.capture => continue,
                _ => {}
            }

            if reg.once {
                self.remove_event_listener(event.event_type(), &reg.listener, reg.capture);
            }

            event.set_in_passive_listener(reg.passive);
            let result = catch_unwind(AssertUnwindSafe(|| reg.listener.handle_event(event)));
            event.set_in_passive_listener(false);

            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event_type = event.event_type(), error = %err, "Event listener error");
                }
                Err(panic) => {
                    error!(
                        event_type = event.event_type(),
                        "{}",
                        ScriptError::from_panic("Event listener", panic)
                    );
                }
            }

            if event.immediate_propagation_stopped() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventInit;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, label: &str) -> Listener {
        let log = log.clone();
        let label = label.to_string();
        Listener::native(move |_| {
            log.borrow_mut().push(label.clone());
            Ok(())
        })
    }

    #[test]
    fn test_duplicate_listener_ignored() {
        let target = EventTarget::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let listener = recorder(&log, "a");
        target.add_event_listener("x", listener.clone(), Default::default());
        target.add_event_listener("x", listener.clone(), Default::default());
        target.add_event_listener("x", listener, AddEventListenerOptions::capture());
        assert_eq!(target.listener_count("x"), 2);
    }

    #[test]
    fn test_remove_by_identity_and_capture() {
        let target = EventTarget::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let listener = recorder(&log, "a");
        target.add_event_listener("x", listener.clone(), AddEventListenerOptions::capture());

        target.remove_event_listener("x", &listener, false);
        assert_eq!(target.listener_count("x"), 1);
        target.remove_event_listener("x", &listener, true);
        assert_eq!(target.listener_count("x"), 0);
        target.remove_event_listener("x", &listener, true);
    }

    #[test]
    fn test_script_listener_requires_callable() {
        let err = Listener::from_value(&Value::Null).unwrap_err();
        assert_eq!(err.name(), "TypeError");

        let func = ScriptFunction::new("onx", |_| Ok(Value::Undefined));
        let a = Listener::from_value(&Value::Function(func.clone())).unwrap();
        let b = Listener::Script(func);
        assert!(a.equals(&b));
    }

    #[test]
    fn test_once_listener_removed_before_invocation() {
        let target = EventTarget::new();
        let seen = Rc::new(Cell::new(usize::MAX));
        let seen_in = seen.clone();
        let probe = target.clone();
        target.add_event_listener(
            "x",
            Listener::native(move |_| {
                seen_in.set(probe.listener_count("x"));
                Ok(())
            }),
            AddEventListenerOptions::once(),
        );

        target
            .dispatch_event(&Event::new("x", EventInit::default()))
            .unwrap();
        assert_eq!(seen.get(), 0);
        target
            .dispatch_event(&Event::new("x", EventInit::default()))
            .unwrap();
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn test_listener_errors_do_not_stop_siblings() {
        let target = EventTarget::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        target.add_event_listener(
            "x",
            Listener::native(|_| Err(ScriptError::thrown("Error", "nope"))),
            Default::default(),
        );
        target.add_event_listener("x", Listener::native(|_| panic!("boom")), Default::default());
        target.add_event_listener("x", recorder(&log, "survivor"), Default::default());

        let ok = target
            .dispatch_event(&Event::new("x", EventInit::default()))
            .unwrap();
        assert!(ok);
        assert_eq!(*log.borrow(), vec!["survivor"]);
    }

    #[test]
    fn test_passive_listener_cannot_cancel() {
        let target = EventTarget::new();
        target.add_event_listener(
            "wheel",
            Listener::native(|event| {
                event.prevent_default();
                Ok(())
            }),
            AddEventListenerOptions {
                passive: true,
                ..Default::default()
            },
        );
        let event = Event::new(
            "wheel",
            EventInit {
                bubbles: false,
                cancelable: true,
            },
        );
        assert!(target.dispatch_event(&event).unwrap());
        assert!(!event.default_prevented());
    }

    #[test]
    fn test_cancel_returns_false() {
        let target = EventTarget::new();
        target.add_event_listener(
            "submit",
            Listener::native(|event| {
                event.prevent_default();
                Ok(())
            }),
            Default::default(),
        );
        let event = Event::new(
            "submit",
            EventInit {
                bubbles: false,
                cancelable: true,
            },
        );
        assert!(!target.dispatch_event(&event).unwrap());
    }

    #[test]
    fn test_transient_fields_cleared_after_dispatch() {
        let target = EventTarget::new();
        let observed = Rc::new(Cell::new(EventPhase::None));
        let observed_in = observed.clone();
        let expected = target.clone();
        target.add_event_listener(
            "x",
            Listener::native(move |event| {
                observed_in.set(event.event_phase());
                assert!(event.target().unwrap().ptr_eq(&expected));
                assert!(event.current_target().unwrap().ptr_eq(&expected));
                Ok(())
            }),
            Default::default(),
        );

        let event = Event::new("x", EventInit::default());
        target.dispatch_event(&event).unwrap();
        assert_eq!(observed.get(), EventPhase::AtTarget);
        assert!(event.target().is_none());
        assert!(event.current_target().is_none());
        assert_eq!(event.event_phase(), EventPhase::None);
        assert!(!event.is_dispatching());
    }

    #[test]
    fn test_redispatch_during_dispatch_is_state_error() {
        let target = EventTarget::new();
        let event = Event::new("x", EventInit::default());
        let inner_target = target.clone();
        let inner_event = event.clone();
        let failure = Rc::new(RefCell::new(None));
        let failure_in = failure.clone();
        target.add_event_listener(
            "x",
            Listener::native(move |_| {
                *failure_in.borrow_mut() = inner_target.dispatch_event(&inner_event).err();
                Ok(())
            }),
            Default::default(),
        );

        target.dispatch_event(&event).unwrap();
        assert!(matches!(*failure.borrow(), Some(ScriptError::State(_))));
        // Reusable once the first dispatch is over.
        assert!(target.dispatch_event(&event).is_ok());
    }

    #[test]
    fn test_parent_cycle_is_guarded() {
        let a = EventTarget::new();
        let b = EventTarget::new();
        a.set_parent(Some(&b));
        b.set_parent(Some(&a));

        let log = Rc::new(RefCell::new(Vec::new()));
        b.add_event_listener("x", recorder(&log, "b bubble"), Default::default());
        let event = Event::new(
            "x",
            EventInit {
                bubbles: true,
                cancelable: false,
            },
        );
        a.dispatch_event(&event).unwrap();
        assert_eq!(*log.borrow(), vec!["b bubble"]);
    }

    #[test]
    fn test_max_depth_limits_walk() {
        let root = EventTarget::new();
        let middle = EventTarget::new();
        let leaf = EventTarget::with_max_depth(1);
        middle.set_parent(Some(&root));
        leaf.set_parent(Some(&middle));

        let log = Rc::new(RefCell::new(Vec::new()));
        root.add_event_listener("x", recorder(&log, "root"), Default::default());
        middle.add_event_listener("x", recorder(&log, "middle"), Default::default());
        let event = Event::new(
            "x",
            EventInit {
                bubbles: true,
                cancelable: false,
            },
        );
        leaf.dispatch_event(&event).unwrap();
        assert_eq!(*log.borrow(), vec!["middle"]);
    }

    #[test]
    fn test_removed_listener_releases_signal_cleanup() {
        let rt = crate::runtime::Runtime::new().unwrap();
        let controller = crate::abort::AbortController::new(&rt);
        let target = EventTarget::new();
        let with_signal = |once: bool| AddEventListenerOptions {
            once,
            signal: Some(controller.signal().clone()),
            ..Default::default()
        };

        for _ in 0..100 {
            let listener = Listener::native(|_| Ok(()));
            target.add_event_listener("x", listener.clone(), with_signal(false));
            target.remove_event_listener("x", &listener, false);
        }
        assert_eq!(controller.signal().pending_cleanups(), 0);

        for _ in 0..100 {
            target.add_event_listener("y", Listener::native(|_| Ok(())), with_signal(true));
            target
                .dispatch_event(&Event::new("y", EventInit::default()))
                .unwrap();
        }
        assert_eq!(target.listener_count("y"), 0);
        assert_eq!(controller.signal().pending_cleanups(), 0);

        // A live registration still goes away on abort.
        target.add_event_listener("z", Listener::native(|_| Ok(())), with_signal(false));
        assert_eq!(controller.signal().pending_cleanups(), 1);
        controller.abort(None);
        assert_eq!(target.listener_count("z"), 0);
    }

    #[test]
    fn test_parent_is_weak() {
        let child = EventTarget::new();
        {
            let parent = EventTarget::new();
            child.set_parent(Some(&parent));
            assert!(child.parent().is_some());
        }
        assert!(child.parent().is_none());
    }
}
