//! AbortController / AbortSignal through the runtime.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tether_runtime::{
    AbortController, AbortKind, AbortSignal, AddEventListenerOptions, Event, EventInit, Listener,
    Runtime, ScriptError, ScriptFunction, Value,
};

fn abort_counter(signal: &AbortSignal) -> Rc<Cell<u32>> {
    let hits = Rc::new(Cell::new(0));
    let seen = hits.clone();
    signal.target().add_event_listener(
        "abort",
        Listener::native(move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        }),
        AddEventListenerOptions::default(),
    );
    hits
}

#[test]
fn test_first_reason_wins_and_event_fires_once() {
    let rt = Runtime::new().unwrap();
    let controller = AbortController::new(&rt);
    let hits = abort_counter(controller.signal());

    controller.abort(Some("x"));
    controller.abort(Some("y"));

    let signal = controller.signal();
    assert!(signal.aborted());
    assert_eq!(signal.reason().unwrap().message(), "x");
    assert_eq!(hits.get(), 1);
    assert_eq!(signal.throw_if_aborted(), Err(ScriptError::Abort("x".into())));
}

#[test]
fn test_default_reason_message() {
    let rt = Runtime::new().unwrap();
    let controller = AbortController::new(&rt);
    controller.abort(None);
    assert_eq!(
        controller.signal().reason().unwrap().message(),
        "This operation was aborted"
    );
}

#[test]
fn test_timeout_zero_aborts_synchronously() {
    let rt = Runtime::new().unwrap();
    let signal = AbortSignal::timeout(&rt, 0.0);
    assert!(signal.aborted());
    assert_eq!(signal.reason().unwrap().kind(), AbortKind::TimedOut);
    assert!(matches!(signal.throw_if_aborted(), Err(ScriptError::Timeout(_))));
}

#[test]
fn test_timeout_delivers_abort_event_through_the_loop() {
    let rt = Runtime::new().unwrap();
    let signal = AbortSignal::timeout(&rt, 10.0);
    let hits = abort_counter(&signal);
    assert!(!signal.aborted());

    // Keep the loop alive past the deadline.
    let keep_alive = ScriptFunction::new("keep_alive", |_| Ok(Value::Undefined));
    rt.set_timeout(&Value::Function(keep_alive), &Value::from(80.0), Vec::new())
        .unwrap();
    rt.run_until_idle().unwrap();

    assert!(signal.aborted());
    assert_eq!(signal.reason().unwrap().kind(), AbortKind::TimedOut);
    assert_eq!(hits.get(), 1);
    assert_eq!(rt.stats().live_signals, 0);
}

#[test]
fn test_any_follows_first_input() {
    let rt = Runtime::new().unwrap();
    let a = AbortController::new(&rt);
    let b = AbortController::new(&rt);
    let combined = AbortSignal::any(&rt, &[a.signal().clone(), b.signal().clone()]);
    let hits = abort_counter(&combined);

    b.abort(Some("from b"));
    a.abort(Some("from a"));

    assert!(combined.aborted());
    assert_eq!(combined.reason().unwrap().message(), "from b");
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_any_of_aborted_input_is_aborted() {
    let rt = Runtime::new().unwrap();
    let done = AbortSignal::already_aborted(&rt, Some("early"));
    let live = AbortController::new(&rt);
    let combined = AbortSignal::any(&rt, &[live.signal().clone(), done]);
    assert!(combined.aborted());
    assert_eq!(combined.reason().unwrap().message(), "early");
}

#[test]
fn test_child_controller_follows_parent() {
    let rt = Runtime::new().unwrap();
    let parent = AbortController::new(&rt);
    let child = AbortController::with_parent(&rt, &parent.signal().context());
    let hits = abort_counter(child.signal());

    parent.abort(Some("shutdown"));
    // The child context aborts at once; its event arrives through a job.
    assert!(child.signal().aborted());
    rt.run_until_idle().unwrap();
    assert_eq!(hits.get(), 1);
    assert_eq!(child.signal().reason().unwrap().message(), "shutdown");
}

#[test]
fn test_abort_from_another_thread() {
    let rt = Runtime::new().unwrap();
    let controller = AbortController::new(&rt);
    let hits = abort_counter(controller.signal());
    let context = controller.signal().context();

    std::thread::spawn(move || {
        context.abort(tether_runtime::AbortReason::aborted(Some("remote")));
    })
    .join()
    .unwrap();

    assert!(controller.signal().aborted());
    assert_eq!(hits.get(), 0);
    rt.run_until_idle().unwrap();
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_signal_removes_listener_on_abort() {
    let rt = Runtime::new().unwrap();
    let controller = AbortController::new(&rt);
    let target = rt.event_target();
    let hits = Rc::new(Cell::new(0));
    let seen = hits.clone();
    target.add_event_listener(
        "ping",
        Listener::native(move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        }),
        AddEventListenerOptions {
            signal: Some(controller.signal().clone()),
            ..Default::default()
        },
    );

    target.dispatch_event(&Event::new("ping", EventInit::default())).unwrap();
    controller.abort(None);
    target.dispatch_event(&Event::new("ping", EventInit::default())).unwrap();

    assert_eq!(hits.get(), 1);
    assert_eq!(target.listener_count("ping"), 0);
}

#[test]
fn test_aborted_signal_skips_registration() {
    let rt = Runtime::new().unwrap();
    let target = rt.event_target();
    target.add_event_listener(
        "ping",
        Listener::native(|_| Ok(())),
        AddEventListenerOptions {
            signal: Some(AbortSignal::already_aborted(&rt, None)),
            ..Default::default()
        },
    );
    assert_eq!(target.listener_count("ping"), 0);
}

#[test]
fn test_on_abort_cleanup_runs_before_event() {
    let rt = Runtime::new().unwrap();
    let controller = AbortController::new(&rt);
    let log = Rc::new(RefCell::new(Vec::new()));

    let cleanup_log = log.clone();
    controller
        .signal()
        .on_abort(move |_| cleanup_log.borrow_mut().push("cleanup"));
    let event_log = log.clone();
    controller.signal().target().add_event_listener(
        "abort",
        Listener::native(move |_| {
            event_log.borrow_mut().push("event");
            Ok(())
        }),
        AddEventListenerOptions::default(),
    );

    controller.abort(None);
    assert_eq!(*log.borrow(), vec!["cleanup", "event"]);

    // Late registration runs at once.
    let late_log = log.clone();
    controller
        .signal()
        .on_abort(move |_| late_log.borrow_mut().push("late"));
    assert_eq!(log.borrow().last(), Some(&"late"));
}

#[test]
fn test_dispose_aborts_live_signals() {
    let rt = Runtime::new().unwrap();
    let controller = AbortController::new(&rt);
    let signal = AbortSignal::timeout(&rt, 60_000.0);
    let hits = abort_counter(controller.signal());
    assert_eq!(rt.stats().live_signals, 2);

    rt.dispose();

    assert!(controller.signal().aborted());
    assert!(signal.aborted());
    assert_eq!(hits.get(), 1);
    assert_eq!(
        controller.signal().reason().unwrap().message(),
        "Runtime has been disposed"
    );
}

#[test]
fn test_signal_from_value() {
    let rt = Runtime::new().unwrap();
    let controller = AbortController::new(&rt);
    let value = controller.signal().to_value();
    assert_eq!(AbortSignal::from_value(&value).unwrap(), *controller.signal());

    let err = AbortSignal::from_value(&Value::from(1.0)).unwrap_err();
    assert_eq!(err.name(), "TypeError");
    assert!(err.message().contains("AbortSignal"));
}

#[tokio::test]
async fn test_context_cancels_worker_future() {
    let ctx = tether_runtime::AbortContext::new();
    let racer = ctx.clone();
    let task = tokio::spawn(async move {
        racer
            .run_until_aborted(tokio::time::sleep(Duration::from_secs(30)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    ctx.abort(tether_runtime::AbortReason::aborted(Some("stop")));
    let outcome = task.await.unwrap();
    assert_eq!(outcome.unwrap_err().message(), "stop");
}
