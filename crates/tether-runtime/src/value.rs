//! Script value model.
//!
//! Functions and host objects are `Rc`-backed and therefore `!Send`: a script
//! value can never be moved to a worker thread, which is exactly the
//! single-owner rule the evaluator requires. Workers exchange plain Rust data
//! and hand it back through the job queue.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::error::{ScriptError, ScriptResult};

/// Native body of a script-callable function.
type FunctionBody = dyn Fn(&[Value]) -> ScriptResult<Value>;

/// A callable script value.
///
/// Identity is the underlying allocation: two clones of the same function are
/// equal, two functions built from identical closures are not.
#[derive(Clone)]
pub struct ScriptFunction {
    name: Rc<str>,
    body: Rc<FunctionBody>,
}

impl ScriptFunction {
    /// Wrap a closure as a script function.
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&[Value]) -> ScriptResult<Value> + 'static,
    {
        Self {
            name: Rc::from(name),
            body: Rc::new(body),
        }
    }

    /// Function name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function.
    pub fn call(&self, args: &[Value]) -> ScriptResult<Value> {
        (self.body)(args)
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &ScriptFunction) -> bool {
        Rc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function: {}]", self.name)
    }
}

impl PartialEq for ScriptFunction {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

/// Opaque handle to a host object (event, signal, target, ...).
#[derive(Clone)]
pub struct HostObject {
    type_name: &'static str,
    inner: Rc<dyn Any>,
}

impl HostObject {
    /// Wrap a host value.
    pub fn new<T: Any>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: Rc::new(value),
        }
    }

    /// Borrow the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Rust type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.type_name.rsplit("::").next().unwrap_or(self.type_name);
        write!(f, "[object {}]", short)
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A script-visible value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Structured data (objects and arrays) as JSON.
    Json(serde_json::Value),
    Function(ScriptFunction),
    Object(HostObject),
}

impl Value {
    /// Wrap a host object.
    pub fn object<T: Any>(value: T) -> Self {
        Self::Object(HostObject::new(value))
    }

    /// Short type tag used in contract error messages.
    pub fn type_of(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Bytes(_) => "Uint8Array",
            Self::Json(_) | Self::Object(_) => "object",
            Self::Function(_) => "function",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    pub fn as_function(&self) -> Option<&ScriptFunction> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Require a callable value; anything else is a contract error.
    pub fn expect_function(&self, what: &str) -> ScriptResult<ScriptFunction> {
        self.as_function().cloned().ok_or_else(|| {
            ScriptError::Contract(format!("{} must be a function, got {}", what, self.type_of()))
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Borrow a host object of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Object(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Numeric coercion used for timer delays and ids: numbers pass through,
    /// numeric strings parse, booleans map to 0/1, everything else is NaN.
    pub fn to_number(&self) -> f64 {
        match self {
            Self::Number(n) => *n,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Null => 0.0,
            Self::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            Self::Json(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    /// Convert to JSON. Functions and host objects have no JSON form.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Undefined | Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Self::Number(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
            Self::String(s) => Some(serde_json::Value::String(s.clone())),
            Self::Bytes(bytes) => Some(serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            )),
            Self::Json(v) => Some(v.clone()),
            Self::Function(_) | Self::Object(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<ScriptFunction> for Value {
    fn from(v: ScriptFunction) -> Self {
        Self::Function(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number).unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}
