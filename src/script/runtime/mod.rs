// src/script/runtime/mod.rs
//! Script runtime: the VM behind the [`Runtime`] contract

pub mod scheduler;
pub mod value;
pub mod vm;

pub use scheduler::{PromiseRef, PromiseState};
pub use value::ScriptValue;
pub use vm::{Builtin, Exception, Vm, MAX_CALL_DEPTH};

use super::ScriptProgram;
use crate::host::{
    Callee, DeferredId, ExportSignature, Invoked, NativeHandle, Runtime, Settlement, Thrown,
};
use crate::marshal::{MarshalContext, MarshalError};
use crate::value::Value;
use ahash::HashMap;
use std::time::Instant;
use value::object_set;

/// A promise the host was told about
struct Tracked {
    promise: PromiseRef,
    /// The host holds a `Value::Pending` for it
    exposed: bool,
    /// Settlement already returned from `poll`
    reported: bool,
}

pub struct ScriptRuntime {
    vm: Vm,
    exports: Vec<ExportSignature>,
    next_handle: u64,
    /// Function handles given to the host, by handle
    handles: HashMap<u64, String>,
    deferred: HashMap<DeferredId, Tracked>,
}

impl ScriptRuntime {
    pub fn new(program: ScriptProgram) -> Self {
        let exports = program.signatures();
        Self {
            vm: Vm::new(program.into_functions()),
            exports,
            next_handle: 1,
            handles: HashMap::default(),
            deferred: HashMap::default(),
        }
    }

    fn track(&mut self, promise: &PromiseRef) -> DeferredId {
        let id = promise.id();
        self.deferred.entry(id).or_insert_with(|| Tracked {
            promise: promise.clone(),
            exposed: false,
            reported: false,
        });
        id
    }

    fn thrown(error: Exception) -> Thrown<ScriptValue> {
        let stack = error.stack();
        Thrown {
            value: error.value,
            stack,
        }
    }
}

impl Runtime for ScriptRuntime {
    type Native = ScriptValue;

    fn exports(&self) -> Vec<ExportSignature> {
        self.exports.clone()
    }

    fn to_native(
        &mut self,
        value: &Value,
        cx: &mut MarshalContext,
    ) -> Result<ScriptValue, MarshalError> {
        match value {
            Value::Null => Ok(ScriptValue::Null),
            Value::Bool(b) => Ok(ScriptValue::Bool(*b)),
            Value::Int(n) => Ok(ScriptValue::Int(*n)),
            Value::Float(f) => Ok(ScriptValue::Float(*f)),
            Value::String(s) => Ok(ScriptValue::Str(s.clone())),
            Value::Sequence(items) => cx.nested(|cx| {
                let items = items
                    .iter()
                    .map(|item| self.to_native(item, cx))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ScriptValue::array(items))
            }),
            Value::Mapping(pairs) => cx.nested(|cx| {
                let object = ScriptValue::object(Vec::with_capacity(pairs.len()));
                if let ScriptValue::Object(obj) = &object {
                    for (key, val) in pairs {
                        let native_key = self.to_native(key, cx)?;
                        if !native_key.is_primitive() {
                            return Err(cx.unsupported(key));
                        }
                        let native_val = self.to_native(val, cx)?;
                        object_set(obj, native_key, native_val);
                    }
                }
                Ok(object)
            }),
            Value::Function(func) => {
                let handle = cx.local_function(func)?;
                self.handles
                    .get(&handle)
                    .map(|name| ScriptValue::Function(name.clone()))
                    .ok_or(MarshalError::StaleReference {
                        module: cx.module(),
                    })
            }
            Value::Pending(pending) => {
                let id = cx.local_deferred(pending)?;
                self.deferred
                    .get(&id)
                    .map(|tracked| ScriptValue::Promise(tracked.promise.clone()))
                    .ok_or(MarshalError::StaleReference {
                        module: cx.module(),
                    })
            }
        }
    }

    fn from_native(
        &mut self,
        native: &ScriptValue,
        cx: &mut MarshalContext,
    ) -> Result<Value, MarshalError> {
        match native {
            ScriptValue::Null => Ok(Value::Null),
            ScriptValue::Bool(b) => Ok(Value::Bool(*b)),
            ScriptValue::Int(n) => Ok(Value::Int(*n)),
            ScriptValue::Float(f) => Ok(Value::Float(*f)),
            ScriptValue::Str(s) => Ok(Value::String(s.clone())),
            ScriptValue::Array(arr) => {
                let items = arr.lock().clone();
                cx.nested(|cx| {
                    items
                        .iter()
                        .map(|item| self.from_native(item, cx))
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Sequence)
                })
            }
            ScriptValue::Object(obj) => {
                let entries = obj.lock().clone();
                cx.nested(|cx| {
                    let mut pairs = Vec::with_capacity(entries.len());
                    for (key, val) in &entries {
                        pairs.push((self.from_native(key, cx)?, self.from_native(val, cx)?));
                    }
                    Ok(Value::Mapping(pairs))
                })
            }
            ScriptValue::Function(name) => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, name.clone());
                Ok(cx.function_ref(handle, Some(name.clone())))
            }
            ScriptValue::Promise(promise) => {
                let id = self.track(promise);
                if let Some(tracked) = self.deferred.get_mut(&id) {
                    tracked.exposed = true;
                }
                Ok(cx.pending_ref(id))
            }
        }
    }

    fn invoke(
        &mut self,
        callee: Callee<'_>,
        args: Vec<ScriptValue>,
    ) -> Result<Invoked<ScriptValue>, Thrown<ScriptValue>> {
        let name = match callee {
            Callee::Export(name) => name.to_string(),
            Callee::Function(handle) => match self.handles.get(&handle) {
                Some(name) => name.clone(),
                None => {
                    return Err(Thrown::new(ScriptValue::str(format!(
                        "function handle {} was released",
                        handle
                    ))))
                }
            },
        };

        match self.vm.call(&name, args) {
            Ok(ScriptValue::Promise(promise)) => match promise.state() {
                PromiseState::Fulfilled(value) => Ok(Invoked::Returned(value)),
                PromiseState::Rejected(error) => Err(Self::thrown(error)),
                PromiseState::Pending => Ok(Invoked::Deferred(self.track(&promise))),
            },
            Ok(value) => Ok(Invoked::Returned(value)),
            Err(error) => Err(Self::thrown(error)),
        }
    }

    fn poll(&mut self, now: Instant) -> Vec<Settlement<ScriptValue>> {
        self.vm.run_pending(now);

        let mut ready: Vec<DeferredId> = self
            .deferred
            .iter()
            .filter(|(_, t)| !t.reported && !t.promise.is_pending())
            .map(|(id, _)| *id)
            .collect();
        ready.sort_unstable();

        let mut settlements = Vec::with_capacity(ready.len());
        for id in ready {
            let Some(tracked) = self.deferred.get_mut(&id) else {
                continue;
            };
            tracked.reported = true;

            let outcome = match tracked.promise.state() {
                PromiseState::Fulfilled(value) => Ok(value),
                PromiseState::Rejected(error) => Err(Self::thrown(error)),
                PromiseState::Pending => continue,
            };
            if !tracked.exposed {
                self.deferred.remove(&id);
            }
            settlements.push(Settlement { id, outcome });
        }
        settlements
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.vm.next_deadline()
    }

    fn release(&mut self, handle: NativeHandle) {
        match handle {
            NativeHandle::Function(handle) => {
                self.handles.remove(&handle);
            }
            // Nothing on the host side refers to it any more, settled or not.
            NativeHandle::Deferred(id) => {
                self.deferred.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runtime(source: &str) -> ScriptRuntime {
        ScriptRuntime::new(ScriptProgram::compile(source).unwrap())
    }

    fn returned(result: Result<Invoked<ScriptValue>, Thrown<ScriptValue>>) -> ScriptValue {
        match result {
            Ok(Invoked::Returned(v)) => v,
            Ok(Invoked::Deferred(id)) => panic!("unexpected deferred {}", id),
            Err(thrown) => panic!("unexpected throw: {}", thrown.value),
        }
    }

    #[test]
    fn test_exports_in_declaration_order() {
        let rt = runtime("function b(x, y) {} async function a() {}");
        assert_eq!(
            rt.exports(),
            vec![
                ExportSignature::new("b", vec!["x".into(), "y".into()], false),
                ExportSignature::new("a", vec![], true),
            ]
        );
    }

    #[test]
    fn test_value_conversion() {
        let mut rt = runtime("function id(x) { return x; }");
        let mut cx = MarshalContext::standalone(crate::script::TAG, 16);

        let value = Value::mapping([
            ("n", Value::Int(1 << 60)),
            ("f", Value::Float(0.5)),
            ("list", Value::from(vec!["a", "b"])),
        ]);
        let native = rt.to_native(&value, &mut cx).unwrap();
        let out = returned(rt.invoke(Callee::Export("id"), vec![native]));
        assert_eq!(rt.from_native(&out, &mut cx).unwrap(), value);
    }

    #[test]
    fn test_mapping_keys_must_be_primitive() {
        let mut rt = runtime("function f() {}");
        let mut cx = MarshalContext::standalone(crate::script::TAG, 16);
        let value = Value::Mapping(vec![(Value::from(vec![1]), Value::Null)]);
        assert!(matches!(
            rt.to_native(&value, &mut cx),
            Err(MarshalError::Unsupported { kind: "sequence", .. })
        ));
    }

    #[test]
    fn test_cyclic_array_is_bounded() {
        let mut rt = runtime("function f() {}");
        let mut cx = MarshalContext::standalone(crate::script::TAG, 8);

        let cyclic = ScriptValue::array(vec![]);
        if let ScriptValue::Array(arr) = &cyclic {
            arr.lock().push(cyclic.clone());
        }
        assert_eq!(
            rt.from_native(&cyclic, &mut cx),
            Err(MarshalError::Cyclic { depth: 8 })
        );

        if let ScriptValue::Array(arr) = &cyclic {
            arr.lock().clear();
        }
    }

    #[test]
    fn test_function_handles_round_trip() {
        let mut rt = runtime("function inc(x) { return x + 1; } function get() { return inc; }");
        let mut cx = MarshalContext::standalone(crate::script::TAG, 16);

        let native = returned(rt.invoke(Callee::Export("get"), vec![]));
        let func = rt.from_native(&native, &mut cx).unwrap();
        let Value::Function(func_ref) = &func else {
            panic!("expected a function, got {}", func);
        };
        assert_eq!(func_ref.name(), Some("inc"));

        let handle = func_ref.handle();
        let out = returned(rt.invoke(Callee::Function(handle), vec![ScriptValue::Int(1)]));
        assert_eq!(out, ScriptValue::Int(2));

        rt.release(NativeHandle::Function(handle));
        assert!(rt.invoke(Callee::Function(handle), vec![]).is_err());
        assert_eq!(
            rt.to_native(&func, &mut cx),
            Err(MarshalError::StaleReference { module: cx.module() })
        );
    }

    #[test]
    fn test_deferred_reported_once() {
        let mut rt = runtime("async function f() { await sleep(5); return 9; }");

        let id = match rt.invoke(Callee::Export("f"), vec![]) {
            Ok(Invoked::Deferred(id)) => id,
            _ => panic!("expected a deferred result"),
        };
        assert!(rt.next_wakeup().is_some());
        assert!(rt.poll(Instant::now()).is_empty());

        std::thread::sleep(Duration::from_millis(10));
        let settlements = rt.poll(Instant::now());
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].id, id);
        assert!(matches!(settlements[0].outcome, Ok(ScriptValue::Int(9))));

        assert!(rt.poll(Instant::now()).is_empty());
        assert!(rt.next_wakeup().is_none());
    }

    #[test]
    fn test_released_deferred_is_not_reported() {
        let mut rt = runtime("async function f() { await sleep(5); return 9; }");

        let Ok(Invoked::Deferred(id)) = rt.invoke(Callee::Export("f"), vec![]) else {
            panic!("expected a deferred result");
        };
        rt.release(NativeHandle::Deferred(id));

        assert!(rt.poll(Instant::now() + Duration::from_millis(50)).is_empty());
        assert!(rt.deferred.is_empty());
    }

    #[test]
    fn test_throw_carries_stack() {
        let mut rt = runtime("function f() { throw { code: 7 }; }");
        let Err(thrown) = rt.invoke(Callee::Export("f"), vec![]) else {
            panic!("expected a throw");
        };
        assert_eq!(thrown.stack.as_deref(), Some("    at f"));
        assert_eq!(thrown.value.to_string(), r#"{"code": 7}"#);
    }
}
