//! Timer registry (setTimeout, setInterval, clearTimeout, clearInterval)
//!
//! Every timer is an entry in the owning thread's registry plus one worker
//! task racing its tick against a stop channel. A tick never runs the callback
//! directly; it enqueues a job, and the job looks the id up again. A timer
//! cleared before its job runs is simply gone from the registry, so its
//! callback can never fire after `clear`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::error::ScriptResult;
use crate::job_queue::JobSender;
use crate::value::{ScriptFunction, Value};

/// Smallest delay, in milliseconds.
pub const MIN_DELAY_MS: u64 = 1;
/// Largest delay, in milliseconds (2^31 - 1).
pub const MAX_DELAY_MS: u64 = 2_147_483_647;

/// Timer identifier returned to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub i64);

impl TimerId {
    /// Interpret a script value as a timer id. Non-numeric values match no timer.
    pub fn from_value(value: &Value) -> Option<Self> {
        let n = value.to_number();
        if n.is_finite() && n.fract() == 0.0 {
            Some(Self(n as i64))
        } else {
            None
        }
    }

    pub fn to_value(self) -> Value {
        Value::from(self.0)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Interval,
}

struct TimerEntry {
    kind: TimerKind,
    callback: ScriptFunction,
    args: Rc<[Value]>,
    stop: Option<oneshot::Sender<()>>,
}

impl TimerEntry {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The task may already have exited after firing; nothing to do then.
            let _ = stop.send(());
        }
    }
}

/// Clamp a script delay to `[MIN_DELAY_MS, MAX_DELAY_MS]`. NaN and missing
/// delays become the minimum.
pub fn clamp_delay(delay: &Value) -> Duration {
    let ms = delay.to_number();
    let ms = if ms.is_nan() || ms < MIN_DELAY_MS as f64 {
        MIN_DELAY_MS
    } else if ms > MAX_DELAY_MS as f64 {
        MAX_DELAY_MS
    } else {
        ms as u64
    };
    Duration::from_millis(ms)
}

/// Active timers of one runtime.
pub struct TimerRegistry {
    entries: RefCell<HashMap<i64, TimerEntry>>,
    next_id: Cell<i64>,
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers that are scheduled and not yet fired (timeouts) or
    /// cleared.
    pub fn active_count(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.borrow().contains_key(&id.0)
    }

    /// Register a timer and start its worker task on `handle`.
    pub(crate) fn schedule(
        &self,
        handle: &Handle,
        sender: JobSender,
        kind: TimerKind,
        callback: ScriptFunction,
        delay: Duration,
        args: Vec<Value>,
    ) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let (stop_tx, stop_rx) = oneshot::channel();
        self.entries.borrow_mut().insert(
            id,
            TimerEntry {
                kind,
                callback,
                args: args.into(),
                stop: Some(stop_tx),
            },
        );

        match kind {
            TimerKind::Timeout => {
                handle.spawn(run_timeout(id, delay, sender, stop_rx));
            }
            TimerKind::Interval => {
                handle.spawn(run_interval(id, delay, sender, stop_rx));
            }
        }

        debug!(timer_id = id, kind = ?kind, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        TimerId(id)
    }

    /// Stop and remove a timer. Unknown or already-cleared ids are ignored.
    pub fn clear(&self, id: TimerId) -> bool {
        let entry = self.entries.borrow_mut().remove(&id.0);
        match entry {
            Some(mut entry) => {
                entry.stop();
                debug!(timer_id = id.0, "Timer cleared");
                true
            }
            None => false,
        }
    }

    /// Stop every timer (runtime dispose).
    pub(crate) fn clear_all(&self) -> usize {
        let entries: Vec<TimerEntry> = self.entries.borrow_mut().drain().map(|(_, e)| e).collect();
        let count = entries.len();
        for mut entry in entries {
            entry.stop();
        }
        count
    }

    /// Run a tick on the owning thread.
    ///
    /// One-shot timers leave the registry before the callback runs, so a
    /// failing callback cannot leave a dead entry behind.
    pub(crate) fn fire(&self, id: i64) -> ScriptResult<()> {
        let fired = {
            let mut entries = self.entries.borrow_mut();
            match entries.get(&id).map(|e| e.kind) {
                Some(TimerKind::Timeout) => entries
                    .remove(&id)
                    .map(|entry| (entry.callback, entry.args)),
                Some(TimerKind::Interval) => entries
                    .get(&id)
                    .map(|entry| (entry.callback.clone(), entry.args.clone())),
                None => None,
            }
        };

        let Some((callback, args)) = fired else {
            trace!(timer_id = id, "Timer cleared before its job ran");
            return Ok(());
        };
        callback.call(&args).map(|_| ())
    }
}

async fn run_timeout(id: i64, delay: Duration, sender: JobSender, stop: oneshot::Receiver<()>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {
            sender.enqueue(move |rt| rt.timers().fire(id));
        }
        _ = stop => {
            sender.enqueue(|_| Ok(()));
        }
    }
}

async fn run_interval(id: i64, period: Duration, sender: JobSender, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A fresh job per tick; nothing carries over between cycles.
                sender.enqueue(move |rt| rt.timers().fire(id));
            }
            _ = &mut stop => {
                sender.enqueue(|_| Ok(()));
                break;
            }
        }
    }
}
