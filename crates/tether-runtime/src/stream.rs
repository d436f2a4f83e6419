//! Single-owner readable byte streams.
//!
//! A [`ReadableStream`] wraps a [`ByteSource`]. At most one [`StreamReader`]
//! holds the lock at a time. Reads run on the blocking pool through the
//! promise bridge, so the source itself lives behind an `Arc<Mutex<..>>` that
//! worker threads can reach; everything else stays on the owning thread.
//!
//! Reads are served in the order they were issued. Each read takes a ticket
//! on the owning thread and its worker waits for that ticket's turn before it
//! touches the source.
//!
//! Cancellation closes the source and drops it. A cancel that arrives while a
//! read holds the source is finished by that read when it returns.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Read};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{ScriptError, ScriptResult};
use crate::promise::Promise;
use crate::runtime::Runtime;

/// Underlying producer of stream bytes.
///
/// `read` follows [`std::io::Read`]: `Ok(0)` is end of stream.
pub trait ByteSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Release the resource. Called at most once, on cancel.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapts any `Read` into a byte source with a no-op close.
struct ReaderSource<R>(R);

impl<R: Read + Send> ByteSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Ticket bookkeeping for in-order reads.
#[derive(Default)]
struct ReadOrder {
    next_ticket: u64,
    serving: u64,
    /// Tickets dropped before their turn came up
    abandoned: BTreeSet<u64>,
}

/// State shared with worker threads.
pub(crate) struct StreamShared {
    source: Mutex<Option<Box<dyn ByteSource>>>,
    canceled: AtomicBool,
    eof: AtomicBool,
    order: Mutex<ReadOrder>,
    turn_changed: Condvar,
}

impl StreamShared {
    pub(crate) fn new(source: Box<dyn ByteSource>) -> Arc<Self> {
        Arc::new(Self {
            source: Mutex::new(Some(source)),
            canceled: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            order: Mutex::new(ReadOrder::default()),
            turn_changed: Condvar::new(),
        })
    }

    /// Reserve the next place in the read order.
    fn take_turn(self: &Arc<Self>) -> ReadTurn {
        let mut order = self.order.lock();
        let ticket = order.next_ticket;
        order.next_ticket += 1;
        ReadTurn {
            shared: self.clone(),
            ticket,
        }
    }

    fn wait_turn(&self, ticket: u64) {
        let mut order = self.order.lock();
        while order.serving != ticket {
            self.turn_changed.wait(&mut order);
        }
    }

    fn finish_turn(&self, ticket: u64) {
        let mut order = self.order.lock();
        if order.serving == ticket {
            order.serving += 1;
            loop {
                let next = order.serving;
                if !order.abandoned.remove(&next) {
                    break;
                }
                order.serving += 1;
            }
        } else {
            order.abandoned.insert(ticket);
        }
        drop(order);
        self.turn_changed.notify_all();
    }

    /// The read primitive every reader flavor goes through.
    ///
    /// A canceled or drained stream reads as end of stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.source.lock();
        let Some(source) = guard.as_mut() else {
            return Ok(0);
        };
        let result = source.read(buf);
        if matches!(result, Ok(0)) {
            self.eof.store(true, Ordering::Release);
        }
        if self.canceled.load(Ordering::Acquire) {
            // Cancel raced this read; finish it now that the source is free.
            close_source(guard.take());
        }
        result
    }

    /// Read until end of stream.
    fn read_to_end(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; 8 * 1024];
        loop {
            match self.read(&mut chunk) {
                Ok(0) => return Ok(out),
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark canceled and close the source. Idempotent; callable from any thread.
    pub(crate) fn cancel(&self) -> bool {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(mut guard) = self.source.try_lock() {
            close_source(guard.take());
        }
        true
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }
}

/// A reserved place in a stream's read order.
///
/// Dropping the turn hands the source to the next reservation, whether or not
/// this one ever read.
struct ReadTurn {
    shared: Arc<StreamShared>,
    ticket: u64,
}

impl ReadTurn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared.wait_turn(self.ticket);
        self.shared.read(buf)
    }

    fn read_to_end(&self) -> io::Result<Vec<u8>> {
        self.shared.wait_turn(self.ticket);
        self.shared.read_to_end()
    }
}

impl Drop for ReadTurn {
    fn drop(&mut self) {
        self.shared.finish_turn(self.ticket);
    }
}

fn close_source(source: Option<Box<dyn ByteSource>>) {
    if let Some(mut source) = source
        && let Err(e) = source.close()
    {
        warn!(error = %e, "Failed to close stream source");
    }
}

/// Reader flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderMode {
    /// The reader allocates a chunk per read.
    #[default]
    Default,
    /// The caller supplies the buffer.
    Byob,
}

/// Outcome of one async read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub value: Option<Vec<u8>>,
    pub done: bool,
}

impl ReadResult {
    pub fn chunk(bytes: Vec<u8>) -> Self {
        Self {
            value: Some(bytes),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            value: None,
            done: true,
        }
    }
}

struct StreamState {
    shared: Arc<StreamShared>,
    locked_by: Cell<Option<u64>>,
    next_reader_id: Cell<u64>,
}

/// A readable byte stream.
#[derive(Clone)]
pub struct ReadableStream {
    inner: Rc<StreamState>,
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStream")
            .field("locked", &self.locked())
            .field("canceled", &self.inner.shared.is_canceled())
            .finish()
    }
}

impl ReadableStream {
    pub fn from_source(source: Box<dyn ByteSource>) -> Self {
        Self::from_shared(StreamShared::new(source))
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::from_source(Box::new(ReaderSource(reader)))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_reader(io::Cursor::new(bytes.into()))
    }

    pub(crate) fn from_shared(shared: Arc<StreamShared>) -> Self {
        Self {
            inner: Rc::new(StreamState {
                shared,
                locked_by: Cell::new(None),
                next_reader_id: Cell::new(1),
            }),
        }
    }

    pub fn locked(&self) -> bool {
        self.inner.locked_by.get().is_some()
    }

    pub fn canceled(&self) -> bool {
        self.inner.shared.is_canceled()
    }

    /// Acquire the reader lock.
    pub fn get_reader(&self, mode: ReaderMode) -> ScriptResult<StreamReader> {
        if self.inner.shared.is_canceled() {
            return Err(ScriptError::state("ReadableStream is already closed"));
        }
        if self.locked() {
            return Err(ScriptError::state("ReadableStream is locked"));
        }
        let id = self.inner.next_reader_id.get();
        self.inner.next_reader_id.set(id + 1);
        self.inner.locked_by.set(Some(id));
        Ok(StreamReader {
            stream: self.clone(),
            id,
            mode,
        })
    }

    /// Close the source and refuse further readers. Idempotent.
    pub fn cancel(&self) {
        if self.inner.shared.cancel() {
            debug!("ReadableStream canceled");
        }
    }

    pub(crate) fn shared(&self) -> Arc<StreamShared> {
        self.inner.shared.clone()
    }
}

/// Lock holder over a [`ReadableStream`].
///
/// Dropping a reader does not release the lock; call
/// [`release_lock`](Self::release_lock).
pub struct StreamReader {
    stream: ReadableStream,
    id: u64,
    mode: ReaderMode,
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("active", &self.is_active())
            .finish()
    }
}

impl StreamReader {
    pub fn mode(&self) -> ReaderMode {
        self.mode
    }

    /// True while this reader holds the stream lock.
    pub fn is_active(&self) -> bool {
        self.stream.inner.locked_by.get() == Some(self.id)
    }

    fn ensure_active(&self) -> ScriptResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ScriptError::Contract(
                "Reader has been released from its stream".to_string(),
            ))
        }
    }

    /// Read the next chunk (default mode).
    pub fn read(&self, rt: &Runtime) -> ScriptResult<Promise<ReadResult>> {
        self.ensure_active()?;
        if self.mode != ReaderMode::Default {
            return Err(ScriptError::Contract(
                "BYOB readers require a buffer, use read_into".to_string(),
            ));
        }
        let chunk_size = rt.config().stream_chunk_size;
        self.read_with(rt, vec![0u8; chunk_size])
    }

    /// Read into a caller-supplied buffer (BYOB mode). The buffer comes back
    /// truncated to the bytes read.
    pub fn read_into(&self, rt: &Runtime, buf: Vec<u8>) -> ScriptResult<Promise<ReadResult>> {
        self.ensure_active()?;
        if self.mode != ReaderMode::Byob {
            return Err(ScriptError::Contract(
                "read_into requires a BYOB reader".to_string(),
            ));
        }
        if buf.is_empty() {
            return Err(ScriptError::Contract(
                "view must have non-zero byteLength".to_string(),
            ));
        }
        self.read_with(rt, buf)
    }

    fn read_with(&self, rt: &Runtime, mut buf: Vec<u8>) -> ScriptResult<Promise<ReadResult>> {
        let shared = self.stream.shared();
        if shared.is_eof() || shared.is_canceled() {
            return Ok(Promise::resolved(ReadResult::done()));
        }
        let turn = shared.take_turn();
        Ok(rt.promise_blocking(
            move || {
                let n = turn.read(&mut buf)?;
                buf.truncate(n);
                Ok(buf)
            },
            |_, result: ScriptResult<Vec<u8>>| {
                result.map(|buf| {
                    if buf.is_empty() {
                        ReadResult::done()
                    } else {
                        ReadResult::chunk(buf)
                    }
                })
            },
        ))
    }

    /// Read everything left in the stream.
    pub fn read_all(&self, rt: &Runtime) -> ScriptResult<Promise<Vec<u8>>> {
        self.ensure_active()?;
        let turn = self.stream.shared().take_turn();
        Ok(rt.promise_blocking(move || Ok(turn.read_to_end()?), |_, result| result))
    }

    /// Cancel the stream. Allowed after [`release_lock`](Self::release_lock).
    pub fn cancel(&self) {
        self.stream.cancel();
    }

    /// Give the lock back without touching the source. Idempotent.
    pub fn release_lock(&self) {
        if self.is_active() {
            self.stream.inner.locked_by.set(None);
        }
    }
}

/// Blocking reads on the calling thread, in order with any async reads issued
/// before. Safe to call from inside a tokio runtime.
impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_active() {
            return Err(io::Error::other(ScriptError::Contract(
                "Reader has been released from its stream".to_string(),
            )));
        }
        // Queued behind any async reads still in flight.
        self.stream.shared().take_turn().read(buf)
    }
}
