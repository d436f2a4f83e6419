//! Body-bearing objects: [`Body`] and [`Response`].
//!
//! A body can be consumed once. The first `text()`, `bytes()` or `json()`
//! locks the underlying stream and reads it to the end on the blocking pool;
//! every later call rejects.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::error::{ScriptError, ScriptResult};
use crate::promise::Promise;
use crate::runtime::Runtime;
use crate::stream::{ReadableStream, ReaderMode};
use crate::value::Value;

const BODY_USED: &str = "body stream already read";

/// A single-consumption body over an optional stream.
pub struct Body {
    stream: Option<ReadableStream>,
    used: Cell<bool>,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("stream", &self.stream)
            .field("used", &self.used.get())
            .finish()
    }
}

impl Body {
    pub fn new(stream: Option<ReadableStream>) -> Self {
        Self {
            stream,
            used: Cell::new(false),
        }
    }

    pub fn empty() -> Self {
        Self::new(None)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(ReadableStream::from_bytes(bytes)))
    }

    /// The stream, for callers that read it directly.
    pub fn stream(&self) -> Option<&ReadableStream> {
        self.stream.as_ref()
    }

    /// True once consumed, or while someone else holds the stream lock.
    pub fn body_used(&self) -> bool {
        self.used.get() || self.stream.as_ref().is_some_and(ReadableStream::locked)
    }

    pub fn bytes(&self, rt: &Runtime) -> Promise<Vec<u8>> {
        self.consume(rt, Ok)
    }

    /// Invalid UTF-8 is replaced, not rejected.
    pub fn text(&self, rt: &Runtime) -> Promise<String> {
        self.consume(rt, |bytes| Ok(String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn json(&self, rt: &Runtime) -> Promise<Value> {
        self.consume(rt, |bytes| {
            let json: serde_json::Value = serde_json::from_slice(&bytes)?;
            Ok(Value::from(json))
        })
    }

    fn consume<U, F>(&self, rt: &Runtime, convert: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(Vec<u8>) -> ScriptResult<U> + Send + 'static,
    {
        if self.used.replace(true) {
            return Promise::rejected(ScriptError::state(BODY_USED));
        }
        let Some(stream) = &self.stream else {
            return match convert(Vec::new()) {
                Ok(value) => Promise::resolved(value),
                Err(err) => Promise::rejected(err),
            };
        };

        // The lock stays with the consumed body; the reader is never released.
        let reader = match stream.get_reader(ReaderMode::Default) {
            Ok(reader) => reader,
            Err(err) => return Promise::rejected(err),
        };
        match reader.read_all(rt) {
            Ok(bytes) => {
                let (promise, resolver) = Promise::pending();
                bytes.on_settled(move |result| {
                    resolver.settle(result.and_then(convert));
                });
                promise
            }
            Err(err) => Promise::rejected(err),
        }
    }
}

/// An HTTP response. Cheap to clone; clones share the body.
#[derive(Debug, Clone)]
pub struct Response {
    inner: Rc<ResponseInner>,
}

#[derive(Debug)]
struct ResponseInner {
    status: u16,
    status_text: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Body,
}

impl Response {
    pub fn new(status: u16, body: Body) -> Self {
        Self::with_parts(status, String::new(), String::new(), Vec::new(), body)
    }

    pub(crate) fn with_parts(
        status: u16,
        status_text: String,
        url: String,
        headers: Vec<(String, String)>,
        body: Body,
    ) -> Self {
        Self {
            inner: Rc::new(ResponseInner {
                status,
                status_text,
                url,
                headers,
                body,
            }),
        }
    }

    pub fn status(&self) -> u16 {
        self.inner.status
    }

    pub fn status_text(&self) -> &str {
        &self.inner.status_text
    }

    /// True for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.inner.status)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.inner.headers
    }

    /// First header value with a case-insensitive name match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &Body {
        &self.inner.body
    }

    pub fn body_used(&self) -> bool {
        self.inner.body.body_used()
    }

    pub fn bytes(&self, rt: &Runtime) -> Promise<Vec<u8>> {
        self.inner.body.bytes(rt)
    }

    pub fn text(&self, rt: &Runtime) -> Promise<String> {
        self.inner.body.text(rt)
    }

    pub fn json(&self, rt: &Runtime) -> Promise<Value> {
        self.inner.body.json(rt)
    }
}
