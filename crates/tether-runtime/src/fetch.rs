//! Fetch API
//!
//! A thin consumer of the core primitives: the request runs on a worker
//! through the promise bridge and races the signal's abort context; the
//! response body is a [`ReadableStream`] whose reads go through the same
//! context. Uses reqwest with rustls for TLS support.

use std::io;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::HeaderMap;
use tokio::runtime::Handle;
use tracing::debug;

use crate::abort::{AbortContext, AbortSignal};
use crate::body::{Body, Response};
use crate::error::{ScriptError, ScriptResult};
use crate::promise::Promise;
use crate::runtime::Runtime;
use crate::stream::{ByteSource, ReadableStream, StreamShared};

/// Request description for [`fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub signal: Option<AbortSignal>,
}

impl FetchRequest {
    /// A `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            ..Self::default()
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Parse method string to reqwest Method
fn parse_method(method: &str) -> ScriptResult<Method> {
    if method.is_empty() {
        return Ok(Method::GET);
    }
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ScriptError::Contract(format!("'{}' is not a valid HTTP method", method)))
}

fn headers_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Response head produced by the worker.
struct FetchedHead {
    status: u16,
    status_text: String,
    url: String,
    headers: Vec<(String, String)>,
    body: std::sync::Arc<StreamShared>,
}

/// Response body as a blocking byte source. Each read blocks the calling
/// thread on the next network chunk, or on the abort.
///
/// The connection is driven by the pool behind `handle`, so the calling thread
/// may itself be inside a tokio runtime as long as it is not that pool's only
/// worker.
struct ResponseSource {
    response: Option<reqwest::Response>,
    pending: Bytes,
    handle: Handle,
    context: AbortContext,
}

impl ByteSource for ResponseSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            let Some(response) = self.response.as_mut() else {
                return Ok(0);
            };
            let _enter = self.handle.enter();
            let next =
                futures::executor::block_on(self.context.run_until_aborted(response.chunk()));
            match next {
                Ok(Ok(Some(chunk))) => self.pending = chunk,
                Ok(Ok(None)) => {
                    self.response = None;
                    return Ok(0);
                }
                Ok(Err(e)) => return Err(io::Error::other(ScriptError::Network(e.to_string()))),
                Err(reason) => return Err(io::Error::other(ScriptError::from(reason))),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the response closes the connection.
        self.response = None;
        self.pending = Bytes::new();
        Ok(())
    }
}

/// `fetch(request)`.
///
/// An already-aborted signal yields a promise rejected with its reason.
/// Otherwise argument errors (bad URL or method) are returned synchronously. An abort
/// during the request rejects the promise; an abort after the response
/// arrived cancels the body stream.
pub fn fetch(rt: &Runtime, request: FetchRequest) -> ScriptResult<Promise<Response>> {
    let context = match &request.signal {
        Some(signal) => {
            if let Some(reason) = signal.reason() {
                return Ok(Promise::rejected(reason.into()));
            }
            signal.context()
        }
        None => AbortContext::new(),
    };

    let url = url::Url::parse(&request.url)
        .map_err(|e| ScriptError::Contract(format!("Invalid URL '{}': {}", request.url, e)))?;
    let method = parse_method(&request.method)?;

    let client = rt.http_client()?;
    let mut builder = client.request(method.clone(), url.clone());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    debug!(method = %method, url = %url, "fetch");

    let work_context = context.clone();
    Ok(rt.promise_new(
        async move {
            let response = match work_context.run_until_aborted(builder.send()).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(ScriptError::Network(e.to_string())),
                Err(reason) => return Err(reason.into()),
            };

            let status = response.status();
            let head_url = response.url().to_string();
            let headers = headers_to_vec(response.headers());
            let body = StreamShared::new(Box::new(ResponseSource {
                response: Some(response),
                pending: Bytes::new(),
                handle: Handle::current(),
                context: work_context.clone(),
            }));

            // Abort after the response arrived cancels the body stream.
            let weak = std::sync::Arc::downgrade(&body);
            work_context.after_abort(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.cancel();
                }
            });

            Ok(FetchedHead {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                url: head_url,
                headers,
                body,
            })
        },
        |_, result| {
            result.map(|head| {
                Response::with_parts(
                    head.status,
                    head.status_text,
                    head.url,
                    head.headers,
                    Body::new(Some(ReadableStream::from_shared(head.body))),
                )
            })
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("get").unwrap(), Method::GET);
        assert_eq!(parse_method("POST").unwrap(), Method::POST);
        assert_eq!(parse_method("Delete").unwrap(), Method::DELETE);
        assert_eq!(parse_method("").unwrap(), Method::GET);
        assert!(parse_method("NOT A METHOD").is_err());
    }

    #[test]
    fn test_headers_to_vec() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("x-custom", "value".parse().unwrap());
        let mut pairs = headers_to_vec(&headers);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("x-custom".to_string(), "value".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_url_is_contract_error() {
        let rt = Runtime::new().unwrap();
        let err = fetch(&rt, FetchRequest::get("not a url")).unwrap_err();
        assert_eq!(err.name(), "TypeError");
    }

    #[test]
    fn test_aborted_signal_rejects_without_request() {
        let rt = Runtime::new().unwrap();
        let signal = AbortSignal::already_aborted(&rt, Some("never mind"));
        let promise = fetch(
            &rt,
            FetchRequest::get("http://127.0.0.1:9/").signal(signal),
        )
        .unwrap();
        assert_eq!(
            promise.result().map(|r| r.map(|_| ())),
            Some(Err(ScriptError::Abort("never mind".into())))
        );
        assert_eq!(rt.stats().inflight, 0);
    }
}
