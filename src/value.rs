// src/value.rs
//! Values that cross the runtime boundary

use crate::host::{DeferredId, ModuleHost, ModuleId, NativeHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

/// Dynamic value exchanged between the host and an embedded runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Value>),
    /// Key/value pairs in native order. Keys are not required to be unique here.
    Mapping(Vec<(Value, Value)>),
    #[serde(skip)]
    Function(FunctionRef),
    #[serde(skip)]
    Pending(PendingRef),
}

impl Value {
    /// Build a mapping from string keys
    pub fn mapping<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Mapping(
            pairs
                .into_iter()
                .map(|(k, v)| (Value::String(k.into()), v))
                .collect(),
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view that accepts both numeric tags
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_pending(&self) -> Option<&PendingRef> {
        match self {
            Value::Pending(p) => Some(p),
            _ => None,
        }
    }

    /// First value stored under `key` in a mapping
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Mapping(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
            Value::Function(_) => "function",
            Value::Pending(_) => "pending",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Sequence(items) => {
                write!(f, "[")?;
                for (i, val) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val)?;
                }
                write!(f, "]")
            }
            Value::Mapping(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Function(func) => write!(f, "{}", func),
            Value::Pending(p) => write!(f, "{}", p),
        }
    }
}

// Convenient conversions
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<FunctionRef> for Value {
    fn from(f: FunctionRef) -> Self {
        Value::Function(f)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Sequence(v.into_iter().map(|x| x.into()).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Handle to a native object that stays inside its runtime.
///
/// When the last clone is dropped the owning module is told to release the
/// native object.
struct OpaqueHandle {
    module: ModuleId,
    tag: String,
    handle: NativeHandle,
    label: Option<String>,
    /// `None` for handles created outside a module host (runtime unit tests).
    owner: Option<Weak<ModuleHost>>,
}

impl OpaqueHandle {
    fn is_live(&self) -> bool {
        match &self.owner {
            None => true,
            Some(weak) => weak.upgrade().map_or(false, |host| host.is_alive()),
        }
    }
}

impl Drop for OpaqueHandle {
    fn drop(&mut self) {
        if let Some(host) = self.owner.as_ref().and_then(Weak::upgrade) {
            host.release(self.handle);
        }
    }
}

/// Callable that lives in the runtime that produced it
#[derive(Clone)]
pub struct FunctionRef {
    inner: Arc<OpaqueHandle>,
}

impl FunctionRef {
    pub(crate) fn new(
        module: ModuleId,
        tag: &str,
        handle: u64,
        label: Option<String>,
        owner: Option<Weak<ModuleHost>>,
    ) -> Self {
        Self {
            inner: Arc::new(OpaqueHandle {
                module,
                tag: tag.to_string(),
                handle: NativeHandle::Function(handle),
                label,
                owner,
            }),
        }
    }

    pub fn module(&self) -> ModuleId {
        self.inner.module
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Runtime-local handle number
    pub fn handle(&self) -> u64 {
        match self.inner.handle {
            NativeHandle::Function(id) | NativeHandle::Deferred(id) => id,
        }
    }

    /// Native name of the function, when the runtime knows one
    pub fn name(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Whether the owning module is still loaded
    pub fn is_live(&self) -> bool {
        self.inner.is_live()
    }

    pub(crate) fn host(&self) -> Option<Arc<ModuleHost>> {
        self.inner.owner.as_ref().and_then(Weak::upgrade)
    }
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.module == other.inner.module && self.inner.handle == other.inner.handle
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRef")
            .field("module", &self.inner.module)
            .field("tag", &self.inner.tag)
            .field("handle", &self.handle())
            .field("name", &self.inner.label)
            .finish()
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.label {
            Some(name) => write!(f, "[function {}:{}]", self.inner.tag, name),
            None => write!(f, "[function {}#{}]", self.inner.tag, self.handle()),
        }
    }
}

/// In-flight asynchronous operation owned by a runtime
#[derive(Clone)]
pub struct PendingRef {
    inner: Arc<OpaqueHandle>,
}

impl PendingRef {
    pub(crate) fn new(
        module: ModuleId,
        tag: &str,
        id: DeferredId,
        owner: Option<Weak<ModuleHost>>,
    ) -> Self {
        Self {
            inner: Arc::new(OpaqueHandle {
                module,
                tag: tag.to_string(),
                handle: NativeHandle::Deferred(id),
                label: None,
                owner,
            }),
        }
    }

    pub fn module(&self) -> ModuleId {
        self.inner.module
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn id(&self) -> DeferredId {
        match self.inner.handle {
            NativeHandle::Function(id) | NativeHandle::Deferred(id) => id,
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.is_live()
    }

    pub(crate) fn host(&self) -> Option<Arc<ModuleHost>> {
        self.inner.owner.as_ref().and_then(Weak::upgrade)
    }
}

impl PartialEq for PendingRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.module == other.inner.module && self.inner.handle == other.inner.handle
    }
}

impl fmt::Debug for PendingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRef")
            .field("module", &self.inner.module)
            .field("tag", &self.inner.tag)
            .field("id", &self.id())
            .finish()
    }
}

impl fmt::Display for PendingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[pending {}#{}]", self.inner.tag, self.id())
    }
}
