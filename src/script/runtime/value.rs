// src/script/runtime/value.rs
//! Values as the script VM sees them
//!
//! Arrays and objects are shared, mutable references, so they can alias and
//! even contain themselves. Anything that walks them takes a snapshot of the
//! elements first and never holds a lock across recursion.

use super::scheduler::PromiseRef;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

pub type ArrayRef = Arc<Mutex<Vec<ScriptValue>>>;
pub type ObjectRef = Arc<Mutex<Vec<(ScriptValue, ScriptValue)>>>;

/// Nesting printed by `Display` before eliding
const DISPLAY_DEPTH: usize = 8;

#[derive(Clone)]
pub enum ScriptValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(ArrayRef),
    /// Key/value pairs in insertion order
    Object(ObjectRef),
    /// Script function or builtin, by name
    Function(String),
    Promise(PromiseRef),
}

impl ScriptValue {
    pub fn array(items: Vec<ScriptValue>) -> Self {
        ScriptValue::Array(Arc::new(Mutex::new(items)))
    }

    pub fn object(entries: Vec<(ScriptValue, ScriptValue)>) -> Self {
        ScriptValue::Object(Arc::new(Mutex::new(entries)))
    }

    pub fn str(s: impl Into<String>) -> Self {
        ScriptValue::Str(s.into())
    }

    /// Truthiness, for conditionals
    pub fn truthy(&self) -> bool {
        match self {
            ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Int(n) => *n != 0,
            ScriptValue::Float(f) => *f != 0.0 && !f.is_nan(),
            ScriptValue::Str(s) => !s.is_empty(),
            ScriptValue::Array(_)
            | ScriptValue::Object(_)
            | ScriptValue::Function(_)
            | ScriptValue::Promise(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Int(_) | ScriptValue::Float(_) => "number",
            ScriptValue::Str(_) => "string",
            ScriptValue::Array(_) => "array",
            ScriptValue::Object(_) => "object",
            ScriptValue::Function(_) => "function",
            ScriptValue::Promise(_) => "promise",
        }
    }

    /// Whether the value may be used as an object key
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ScriptValue::Null
                | ScriptValue::Bool(_)
                | ScriptValue::Int(_)
                | ScriptValue::Float(_)
                | ScriptValue::Str(_)
        )
    }

    /// Non-negative integral index
    pub fn as_index(&self) -> Option<usize> {
        match self {
            ScriptValue::Int(n) if *n >= 0 => Some(*n as usize),
            ScriptValue::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Some(*f as usize),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Int(n) => Some(*n as f64),
            ScriptValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Text used by `str()` and string concatenation: strings are not quoted
    pub fn to_display_string(&self) -> String {
        match self {
            ScriptValue::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            ScriptValue::Null => write!(f, "null"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Int(n) => write!(f, "{}", n),
            ScriptValue::Float(n) => write!(f, "{}", n),
            ScriptValue::Str(s) => write!(f, "\"{}\"", s),
            ScriptValue::Function(name) => write!(f, "<function {}>", name),
            ScriptValue::Promise(p) => write!(f, "<promise {}>", p.id()),
            ScriptValue::Array(_) | ScriptValue::Object(_) if depth >= DISPLAY_DEPTH => {
                write!(f, "...")
            }
            ScriptValue::Array(arr) => {
                let items = arr.lock().clone();
                write!(f, "[")?;
                for (i, val) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    val.render(f, depth + 1)?;
                }
                write!(f, "]")
            }
            ScriptValue::Object(obj) => {
                let entries = obj.lock().clone();
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    k.render(f, depth + 1)?;
                    write!(f, ": ")?;
                    v.render(f, depth + 1)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl PartialEq for ScriptValue {
    /// Primitives compare by value, containers and promises by identity
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScriptValue::Null, ScriptValue::Null) => true,
            (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
            (ScriptValue::Int(a), ScriptValue::Int(b)) => a == b,
            (ScriptValue::Float(a), ScriptValue::Float(b)) => a == b,
            (ScriptValue::Int(a), ScriptValue::Float(b))
            | (ScriptValue::Float(b), ScriptValue::Int(a)) => *a as f64 == *b,
            (ScriptValue::Str(a), ScriptValue::Str(b)) => a == b,
            (ScriptValue::Function(a), ScriptValue::Function(b)) => a == b,
            (ScriptValue::Array(a), ScriptValue::Array(b)) => Arc::ptr_eq(a, b),
            (ScriptValue::Object(a), ScriptValue::Object(b)) => Arc::ptr_eq(a, b),
            (ScriptValue::Promise(a), ScriptValue::Promise(b)) => a.same(b),
            _ => false,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<i32> for ScriptValue {
    fn from(n: i32) -> Self {
        ScriptValue::Int(n as i64)
    }
}

impl From<i64> for ScriptValue {
    fn from(n: i64) -> Self {
        ScriptValue::Int(n)
    }
}

impl From<f64> for ScriptValue {
    fn from(f: f64) -> Self {
        ScriptValue::Float(f)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::Str(s.to_string())
    }
}

/// Look a key up in an object
pub fn object_get(obj: &ObjectRef, key: &ScriptValue) -> ScriptValue {
    obj.lock()
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .unwrap_or(ScriptValue::Null)
}

/// Replace the first entry with `key`, or append one
pub fn object_set(obj: &ObjectRef, key: ScriptValue, value: ScriptValue) {
    let mut entries = obj.lock();
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
}
