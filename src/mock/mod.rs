// src/mock/mod.rs
//! Declarative mock runtime, registered under the `"mock"` tag.
//!
//! Its value system copies the shape of a typical JavaScript engine: one
//! double-precision number type, string-keyed records and no callable or
//! promise values at the boundary. That makes it the reference for the
//! float-only marshaling rules ([`int_to_double`], [`double_to_value`]).
//!
//! Modules are lists of canned functions, see [`declaration`] for the format.

pub mod declaration;
pub mod value;

use crate::host::{
    read_sources, Callee, DeferredId, ExportSignature, Invoked, LoadedRuntime, LoaderBackend,
    NativeHandle, Runtime, Settlement, Thrown,
};
use crate::marshal::{double_to_value, int_to_double, MarshalContext, MarshalError};
use crate::value::Value;
use crate::LoadError;
use ahash::HashMap;
use declaration::{parse_declarations, Declaration, Outcome};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
pub use value::MockValue;

/// Language tag of the mock backend
pub const TAG: &str = "mock";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MockError {
    #[error("line {line}: {message}")]
    Declaration { line: usize, message: String },
}

impl From<MockError> for LoadError {
    fn from(err: MockError) -> Self {
        LoadError::Syntax(err.to_string())
    }
}

pub struct MockRuntime {
    declarations: Vec<Declaration>,
    by_name: HashMap<String, usize>,
    next_id: DeferredId,
    timers: BinaryHeap<Reverse<(Instant, DeferredId)>>,
    scheduled: HashMap<DeferredId, Result<MockValue, MockValue>>,
}

impl MockRuntime {
    pub fn new(declarations: Vec<Declaration>) -> Self {
        let by_name = declarations
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        Self {
            declarations,
            by_name,
            next_id: 1,
            timers: BinaryHeap::new(),
            scheduled: HashMap::default(),
        }
    }

    pub fn parse(source: &str) -> Result<Self, MockError> {
        Ok(Self::new(parse_declarations(source)?))
    }
}

impl Runtime for MockRuntime {
    type Native = MockValue;

    fn exports(&self) -> Vec<ExportSignature> {
        self.declarations
            .iter()
            .map(|d| ExportSignature::new(d.name.clone(), d.params.clone(), d.delay.is_some()))
            .collect()
    }

    fn to_native(&mut self, value: &Value, cx: &mut MarshalContext) -> Result<MockValue, MarshalError> {
        match value {
            Value::Null => Ok(MockValue::Undefined),
            Value::Bool(b) => Ok(MockValue::Boolean(*b)),
            Value::Int(n) => Ok(MockValue::Number(int_to_double(*n, cx.tag())?)),
            Value::Float(f) => Ok(MockValue::Number(*f)),
            Value::String(s) => Ok(MockValue::Text(s.clone())),
            Value::Sequence(items) => cx.nested(|cx| {
                items
                    .iter()
                    .map(|item| self.to_native(item, cx))
                    .collect::<Result<Vec<_>, _>>()
                    .map(MockValue::List)
            }),
            Value::Mapping(pairs) => cx.nested(|cx| {
                let mut fields = Vec::with_capacity(pairs.len());
                for (key, val) in pairs {
                    let Value::String(key) = key else {
                        return Err(cx.unsupported(key));
                    };
                    fields.push((key.clone(), self.to_native(val, cx)?));
                }
                Ok(MockValue::Record(fields))
            }),
            Value::Function(_) | Value::Pending(_) => Err(cx.unsupported(value)),
        }
    }

    fn from_native(&mut self, native: &MockValue, cx: &mut MarshalContext) -> Result<Value, MarshalError> {
        match native {
            MockValue::Undefined => Ok(Value::Null),
            MockValue::Boolean(b) => Ok(Value::Bool(*b)),
            MockValue::Number(n) => Ok(double_to_value(*n)),
            MockValue::Text(s) => Ok(Value::String(s.clone())),
            MockValue::List(items) => cx.nested(|cx| {
                items
                    .iter()
                    .map(|item| self.from_native(item, cx))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Sequence)
            }),
            MockValue::Record(fields) => cx.nested(|cx| {
                let mut pairs = Vec::with_capacity(fields.len());
                for (key, val) in fields {
                    pairs.push((Value::String(key.clone()), self.from_native(val, cx)?));
                }
                Ok(Value::Mapping(pairs))
            }),
        }
    }

    fn invoke(
        &mut self,
        callee: Callee<'_>,
        args: Vec<MockValue>,
    ) -> Result<Invoked<MockValue>, Thrown<MockValue>> {
        let name = match callee {
            Callee::Export(name) => name,
            Callee::Function(_) => {
                return Err(Thrown::new(MockValue::text("mock modules have no function values")))
            }
        };

        let Some(declaration) = self.by_name.get(name).map(|&i| &self.declarations[i]) else {
            return Err(Thrown::new(MockValue::text(format!("{} is not defined", name))));
        };

        if args.len() != declaration.params.len() {
            return Err(Thrown::new(MockValue::text(format!(
                "{} expects {} arguments, got {}",
                name,
                declaration.params.len(),
                args.len()
            ))));
        }

        let outcome = match &declaration.outcome {
            Outcome::Return(expr) => Ok(expr.evaluate(&args)),
            Outcome::Throw(expr) => Err(expr.evaluate(&args)),
        };

        match declaration.delay {
            Some(delay) => {
                let id = self.next_id;
                self.next_id += 1;
                self.timers.push(Reverse((Instant::now() + delay, id)));
                self.scheduled.insert(id, outcome);
                Ok(Invoked::Deferred(id))
            }
            None => outcome.map(Invoked::Returned).map_err(Thrown::new),
        }
    }

    fn poll(&mut self, now: Instant) -> Vec<Settlement<MockValue>> {
        let mut settlements = Vec::new();
        while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            if let Some(outcome) = self.scheduled.remove(&id) {
                settlements.push(Settlement {
                    id,
                    outcome: outcome.map_err(Thrown::new),
                });
            }
        }
        settlements
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((deadline, _))| *deadline)
    }

    fn release(&mut self, handle: NativeHandle) {
        if let NativeHandle::Deferred(id) = handle {
            self.scheduled.remove(&id);
        }
    }
}

/// Loader for mock declaration files
#[derive(Debug, Default, Clone, Copy)]
pub struct MockBackend;

impl MockBackend {
    pub fn new() -> Self {
        MockBackend
    }
}

impl LoaderBackend for MockBackend {
    fn name(&self) -> &str {
        TAG
    }

    fn load_from_memory(&self, source: &str) -> Result<LoadedRuntime, LoadError> {
        Ok(LoadedRuntime::new(MockRuntime::parse(source)?))
    }

    fn load_from_file(&self, paths: &[PathBuf]) -> Result<LoadedRuntime, LoadError> {
        let source = read_sources(paths)?;
        Ok(LoadedRuntime::new(MockRuntime::parse(&source)?))
    }
}
