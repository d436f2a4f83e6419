//! # Tether Runtime
//!
//! Native host runtime for single-threaded script environments:
//! - Job queue that brings worker results back to the owning thread
//! - Promise bridge for running host work on a tokio worker pool
//! - Timers (`setTimeout`/`setInterval`) and microtasks
//! - AbortController / AbortSignal with cross-thread abort contexts
//! - EventTarget with capture/target/bubble dispatch
//! - ReadableStream readers and single-consumption bodies
//! - A `fetch` built on the primitives above

#![warn(clippy::all)]

pub mod abort;
pub mod body;
pub mod config;
pub mod error;
pub mod event;
pub mod event_target;
pub mod fetch;
pub mod job_queue;
pub mod microtask;
pub mod promise;
pub mod runtime;
pub mod stream;
pub mod timers;
pub mod value;

// Re-export main types
pub use abort::{
    AbortContext, AbortController, AbortKind, AbortReason, AbortSignal, AfterAbortHandle,
    OnAbortHandle,
};
pub use body::{Body, Response};
pub use config::{FetchConfig, RuntimeConfig};
pub use error::{RuntimeError, RuntimeResult, ScriptError, ScriptResult};
pub use event::{Event, EventInit, EventPhase};
pub use event_target::{AddEventListenerOptions, EventTarget, Listener, NativeListener};
pub use fetch::{FetchRequest, fetch};
pub use job_queue::{Job, JobQueue, JobSender, JobStats, JobStatsSnapshot};
pub use microtask::MicrotaskQueue;
pub use promise::{Promise, PromiseResolver, PromiseState};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStats};
pub use stream::{ByteSource, ReadResult, ReadableStream, ReaderMode, StreamReader};
pub use timers::{TimerId, TimerKind, TimerRegistry};
pub use value::{HostObject, ScriptFunction, Value};
