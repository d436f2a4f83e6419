//! Readable streams and their readers driven by the runtime.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tether_runtime::{
    ByteSource, ReadResult, ReadableStream, ReaderMode, Runtime, ScriptError,
};

/// Yields `chunks` one per read, sleeping before each.
struct SlowSource {
    chunks: Vec<Vec<u8>>,
    delay: Duration,
    closed: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl ByteSource for SlowSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if self.chunks.is_empty() {
            return Ok(0);
        }
        let chunk = self.chunks.remove(0);
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn slow_stream(chunks: &[&[u8]], delay: Duration) -> (ReadableStream, Arc<AtomicBool>) {
    let closed = Arc::new(AtomicBool::new(false));
    let source = SlowSource {
        chunks: chunks.iter().map(|c| c.to_vec()).collect(),
        delay,
        closed: closed.clone(),
        reads: Arc::new(AtomicUsize::new(0)),
    };
    (ReadableStream::from_source(Box::new(source)), closed)
}

#[test]
fn test_default_reader_reads_chunks_then_done_repeatedly() {
    let rt = Runtime::new().unwrap();
    let (stream, _closed) = slow_stream(&[b"ab", b"cd"], Duration::ZERO);
    let reader = stream.get_reader(ReaderMode::Default).unwrap();

    let first = rt.block_on(&reader.read(&rt).unwrap()).unwrap();
    assert_eq!(first, ReadResult::chunk(b"ab".to_vec()));
    let second = rt.block_on(&reader.read(&rt).unwrap()).unwrap();
    assert_eq!(second, ReadResult::chunk(b"cd".to_vec()));

    for _ in 0..3 {
        let done = rt.block_on(&reader.read(&rt).unwrap()).unwrap();
        assert_eq!(done, ReadResult::done());
    }
}

#[test]
fn test_byob_reader_fills_supplied_buffer() {
    let rt = Runtime::new().unwrap();
    let stream = ReadableStream::from_bytes(b"0123456789".to_vec());
    let reader = stream.get_reader(ReaderMode::Byob).unwrap();

    let result = rt.block_on(&reader.read_into(&rt, vec![0; 4]).unwrap()).unwrap();
    assert_eq!(result.value.as_deref(), Some(&b"0123"[..]));
    assert!(!result.done);

    let err = reader.read_into(&rt, Vec::new()).unwrap_err();
    assert_eq!(err.name(), "TypeError");

    let err = reader.read(&rt).unwrap_err();
    assert!(matches!(err, ScriptError::Contract(_)));
}

#[test]
fn test_default_reader_rejects_read_into() {
    let rt = Runtime::new().unwrap();
    let stream = ReadableStream::from_bytes(b"x".to_vec());
    let reader = stream.get_reader(ReaderMode::Default).unwrap();
    assert!(matches!(
        reader.read_into(&rt, vec![0; 8]),
        Err(ScriptError::Contract(_))
    ));
}

#[test]
fn test_locked_and_closed_are_distinct_errors() {
    let stream = ReadableStream::from_bytes(b"x".to_vec());
    let reader = stream.get_reader(ReaderMode::Default).unwrap();
    assert_eq!(
        stream.get_reader(ReaderMode::Default).unwrap_err().message(),
        "ReadableStream is locked"
    );

    reader.release_lock();
    stream.cancel();
    assert_eq!(
        stream.get_reader(ReaderMode::Default).unwrap_err().message(),
        "ReadableStream is already closed"
    );
}

#[test]
fn test_released_reader_cannot_read() {
    let rt = Runtime::new().unwrap();
    let stream = ReadableStream::from_bytes(b"x".to_vec());
    let reader = stream.get_reader(ReaderMode::Default).unwrap();
    reader.release_lock();
    assert!(!reader.is_active());
    assert!(matches!(reader.read(&rt), Err(ScriptError::Contract(_))));
}

#[test]
fn test_cancel_during_read_closes_source() {
    let rt = Runtime::new().unwrap();
    let (stream, closed) = slow_stream(&[b"one", b"two"], Duration::from_millis(50));
    let reader = stream.get_reader(ReaderMode::Default).unwrap();

    let pending = reader.read(&rt).unwrap();
    // The read is blocked in the source on a worker.
    std::thread::sleep(Duration::from_millis(10));
    reader.cancel();
    assert!(stream.canceled());

    let _ = rt.block_on(&pending);
    assert!(closed.load(Ordering::SeqCst));

    let after = rt.block_on(&reader.read(&rt).unwrap()).unwrap();
    assert_eq!(after, ReadResult::done());
}

#[test]
fn test_cancel_idle_stream_closes_immediately() {
    let (stream, closed) = slow_stream(&[b"never"], Duration::ZERO);
    stream.cancel();
    stream.cancel();
    assert!(closed.load(Ordering::SeqCst));
}

#[test]
fn test_read_all_collects_everything() {
    let rt = Runtime::new().unwrap();
    let (stream, _closed) = slow_stream(&[b"he", b"ll", b"o"], Duration::from_millis(1));
    let reader = stream.get_reader(ReaderMode::Default).unwrap();
    let all = rt.block_on(&reader.read_all(&rt).unwrap()).unwrap();
    assert_eq!(all, b"hello");
}

#[test]
fn test_small_chunk_size_splits_reads() {
    let rt = Runtime::builder().stream_chunk_size(3).build().unwrap();
    let stream = ReadableStream::from_bytes(b"abcdefg".to_vec());
    let reader = stream.get_reader(ReaderMode::Default).unwrap();

    let mut chunks = Vec::new();
    loop {
        let result = rt.block_on(&reader.read(&rt).unwrap()).unwrap();
        match result.value {
            Some(chunk) => chunks.push(chunk),
            None => break,
        }
    }
    assert_eq!(chunks, vec![b"abc".to_vec(), b"def".to_vec(), b"g".to_vec()]);
}

#[test]
fn test_back_to_back_reads_keep_issue_order() {
    let rt = Runtime::builder().stream_chunk_size(1).build().unwrap();
    let bytes: Vec<u8> = (0..16).collect();
    let stream = ReadableStream::from_bytes(bytes.clone());
    let reader = stream.get_reader(ReaderMode::Default).unwrap();

    // Issued before any of them can settle.
    let pending: Vec<_> = (0..16).map(|_| reader.read(&rt).unwrap()).collect();
    let chunks: Vec<u8> = pending
        .iter()
        .map(|promise| {
            let result = rt.block_on(promise).unwrap();
            result.value.unwrap()[0]
        })
        .collect();
    assert_eq!(chunks, bytes);

    let done = rt.block_on(&reader.read(&rt).unwrap()).unwrap();
    assert_eq!(done, ReadResult::done());
}

#[test]
fn test_sync_read_waits_behind_async_read() {
    use std::io::Read;

    let rt = Runtime::builder().stream_chunk_size(2).build().unwrap();
    let (stream, _closed) = slow_stream(&[b"ab", b"cd"], Duration::from_millis(30));
    let mut reader = stream.get_reader(ReaderMode::Default).unwrap();

    let first = reader.read(&rt).unwrap();
    let mut buf = [0u8; 2];
    let n = Read::read(&mut reader, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"cd");
    assert_eq!(
        rt.block_on(&first).unwrap(),
        ReadResult::chunk(b"ab".to_vec())
    );
}
