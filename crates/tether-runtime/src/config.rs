//! Runtime configuration.
//!
//! Every field has a default, so a partial JSON document is valid:
//!
//! ```
//! use tether_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_json(r#"{ "worker_threads": 2 }"#).unwrap();
//! assert_eq!(config.worker_threads, 2);
//! assert_eq!(config.stream_chunk_size, 64 * 1024);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads in the owned tokio pool. Ignored when an external handle
    /// is supplied to the builder.
    pub worker_threads: usize,

    /// How long the owning thread waits for a job before re-checking whether the
    /// loop is idle.
    pub idle_poll_ms: u64,

    /// Chunk size allocated by default-mode stream readers per read.
    pub stream_chunk_size: usize,

    /// Maximum number of ancestors walked during event dispatch.
    pub max_dispatch_depth: usize,

    /// Fetch client settings.
    pub fetch: FetchConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(8),
            idle_poll_ms: 10,
            stream_chunk_size: 64 * 1024,
            max_dispatch_depth: 1024,
            fetch: FetchConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> RuntimeResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        Ok(config.normalized())
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuntimeError::ConfigFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Idle poll interval as a duration.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    fn normalized(mut self) -> Self {
        self.worker_threads = self.worker_threads.max(1);
        self.idle_poll_ms = self.idle_poll_ms.max(1);
        self.stream_chunk_size = self.stream_chunk_size.max(1);
        self.max_dispatch_depth = self.max_dispatch_depth.max(1);
        self
    }
}

/// HTTP client settings used by [`fetch`](crate::fetch::fetch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// Whole-request timeout. Independent of any `AbortSignal`.
    pub request_timeout_ms: u64,
    /// Idle pooled connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            request_timeout_ms: 300_000,
            pool_max_idle_per_host: 32,
            user_agent: concat!("tether/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
