//! Error types for tether-runtime
//!
//! Two layers:
//!
//! - [`ScriptError`] is what scripts observe: it is thrown synchronously for
//!   contract violations and carried by rejected promises for everything
//!   asynchronous.
//! - [`RuntimeError`] covers host-level failures (building the worker pool,
//!   loading configuration) that never reach script code.

use std::any::Any;

use thiserror::Error;

use crate::abort::{AbortKind, AbortReason};

/// Errors visible to script code.
///
/// Must be `Clone`: a rejected promise hands the same error to every reaction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    /// The operation was aborted through an `AbortSignal`.
    #[error("AbortError: {0}")]
    Abort(String),

    /// A deadline elapsed (delivered through the abort path).
    #[error("TimeoutError: {0}")]
    Timeout(String),

    /// Object is in the wrong state: stream locked or closed, body consumed,
    /// event already dispatching.
    #[error("InvalidStateError: {0}")]
    State(String),

    /// Programmer error: wrong argument type, missing argument, wrong receiver.
    #[error("TypeError: {0}")]
    Contract(String),

    /// Exception raised by script code itself.
    #[error("{name}: {message}")]
    Thrown { name: String, message: String },

    /// Transport failure reported by a network collaborator.
    #[error("NetworkError: {0}")]
    Network(String),

    /// Host bug or recovered panic.
    #[error("InternalError: {0}")]
    Internal(String),
}

impl ScriptError {
    /// Create a contract error describing the expected and actual argument kinds.
    pub fn type_error(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::Contract(format!(
            "expected {}, got {}",
            expected.into(),
            actual.into()
        ))
    }

    /// Create a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Create an exception as if thrown by script code.
    pub fn thrown(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Thrown {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Convert a recovered panic payload into an error.
    pub fn from_panic(context: &str, payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown error".to_string()
        };
        Self::Internal(format!("{} panic: {}", context, detail))
    }

    /// The script-visible error name (`AbortError`, `TypeError`, ...).
    pub fn name(&self) -> &str {
        match self {
            Self::Abort(_) => "AbortError",
            Self::Timeout(_) => "TimeoutError",
            Self::State(_) => "InvalidStateError",
            Self::Contract(_) => "TypeError",
            Self::Thrown { name, .. } => name,
            Self::Network(_) => "NetworkError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// The bare message, without the error name prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Abort(m)
            | Self::Timeout(m)
            | Self::State(m)
            | Self::Contract(m)
            | Self::Network(m)
            | Self::Internal(m) => m,
            Self::Thrown { message, .. } => message,
        }
    }

    /// True for errors produced by the abort path, timeouts included.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_) | Self::Timeout(_))
    }
}

impl From<AbortReason> for ScriptError {
    fn from(reason: AbortReason) -> Self {
        match reason.kind() {
            AbortKind::Aborted => Self::Abort(reason.message().to_string()),
            AbortKind::TimedOut => Self::Timeout(reason.message().to_string()),
        }
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(e: std::io::Error) -> Self {
        // Byte sources wrap script errors (aborts) in io::Error to cross the Read boundary.
        if let Some(inner) = e.get_ref().and_then(|inner| inner.downcast_ref::<ScriptError>()) {
            return inner.clone();
        }
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for ScriptError {
    fn from(e: serde_json::Error) -> Self {
        Self::thrown("SyntaxError", e.to_string())
    }
}

/// Result type alias for script-visible operations
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Host-level errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Worker pool could not be created
    #[error("Failed to start worker pool: {0}")]
    WorkerPool(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("Invalid runtime configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration file could not be read
    #[error("Failed to read configuration from {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The runtime was used after dispose
    #[error("Runtime has been disposed")]
    Disposed,

    /// Script error escaped to the host (for example from `block_on`)
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Result type alias for host-level operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
