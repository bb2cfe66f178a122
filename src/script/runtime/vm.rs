// src/script/runtime/vm.rs
//! Virtual Machine that executes bytecode
//!
//! Synchronous calls run to completion on the Rust stack. Calling an async
//! function starts a task instead: it runs until its first `await` on a
//! pending promise, then parks in the scheduler and the caller receives the
//! task's promise. Parked tasks resume from `run_pending`.

use super::scheduler::{PromiseRef, PromiseState, Scheduler, Task};
use super::value::{object_get, object_set, ScriptValue};
use crate::script::compiler::bytecode::{Constant, Instruction};
use crate::script::compiler::CompiledFunction;
use ahash::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Nested calls allowed before a call throws
pub const MAX_CALL_DEPTH: usize = 256;

/// Functions every program can call without defining them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `sleep(ms)`: promise fulfilled with null after `ms` milliseconds
    Sleep,
    /// `push(array, value)`: append, returning the new length
    Push,
    /// `len(x)`: length of an array, string or object
    Len,
    /// `str(x)`: display text of any value
    Str,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "sleep" => Some(Builtin::Sleep),
            "push" => Some(Builtin::Push),
            "len" => Some(Builtin::Len),
            "str" => Some(Builtin::Str),
            _ => None,
        }
    }
}

/// A thrown value and the functions it unwound through, innermost first
#[derive(Debug, Clone)]
pub struct Exception {
    pub value: ScriptValue,
    pub trace: Vec<String>,
}

impl Exception {
    pub fn new(value: ScriptValue) -> Self {
        Self {
            value,
            trace: Vec::new(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(ScriptValue::Str(message.into()))
    }

    /// Stack text in the familiar `at name` form
    pub fn stack(&self) -> Option<String> {
        if self.trace.is_empty() {
            return None;
        }
        let lines: Vec<String> = self.trace.iter().map(|f| format!("    at {}", f)).collect();
        Some(lines.join("\n"))
    }
}

/// Activation record of one function call
pub struct Frame {
    function: Arc<CompiledFunction>,
    pc: usize,
    stack: Vec<ScriptValue>,
    locals: HashMap<String, ScriptValue>,
}

impl Frame {
    fn new(function: Arc<CompiledFunction>, args: Vec<ScriptValue>) -> Self {
        let mut locals = HashMap::default();
        let mut args = args.into_iter();
        for param in &function.params {
            locals.insert(param.clone(), args.next().unwrap_or(ScriptValue::Null));
        }

        Self {
            function,
            pc: 0,
            stack: Vec::with_capacity(16),
            locals,
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    #[inline]
    fn push(&mut self, value: ScriptValue) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> ScriptValue {
        self.stack.pop().unwrap_or(ScriptValue::Null)
    }

    /// Pop the top two values as `(below, top)`
    #[inline]
    fn pop2(&mut self) -> (ScriptValue, ScriptValue) {
        let b = self.pop();
        let a = self.pop();
        (a, b)
    }

    /// Pop `n` values, returned in push order
    fn pop_n(&mut self, n: usize) -> Vec<ScriptValue> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }
}

/// How a frame stopped running
enum Flow {
    Return(ScriptValue),
    /// Suspended on a pending promise; the frame resumes right after the `Await`
    Await(PromiseRef),
}

pub struct Vm {
    functions: HashMap<String, Arc<CompiledFunction>>,
    scheduler: Scheduler,
}

impl Vm {
    pub fn new(functions: Vec<CompiledFunction>) -> Self {
        Self {
            functions: functions
                .into_iter()
                .map(|f| (f.name.clone(), Arc::new(f)))
                .collect(),
            scheduler: Scheduler::new(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Call a function by name. Async functions return a promise.
    pub fn call(&mut self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, Exception> {
        self.call_named(name, args, 0)
    }

    /// Fire due timers and resume every task whose promise settled
    pub fn run_pending(&mut self, now: Instant) {
        self.scheduler.fire_timers(now);

        while let Some((task, outcome)) = self.scheduler.next_ready() {
            let Task { mut frame, promise } = task;
            match outcome {
                Ok(value) => {
                    frame.push(value);
                    self.drive_task(frame, promise, 0);
                }
                Err(mut error) => {
                    error.trace.push(frame.name().to_string());
                    self.scheduler.reject(&promise, error);
                }
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    fn call_named(
        &mut self,
        name: &str,
        args: Vec<ScriptValue>,
        depth: usize,
    ) -> Result<ScriptValue, Exception> {
        if depth >= MAX_CALL_DEPTH {
            return Err(Exception::message(format!(
                "maximum call depth of {} exceeded",
                MAX_CALL_DEPTH
            )));
        }

        let Some(function) = self.functions.get(name).cloned() else {
            return match Builtin::lookup(name) {
                Some(builtin) => self.call_builtin(builtin, args),
                None => Err(Exception::message(format!("{} is not a function", name))),
            };
        };

        let is_async = function.is_async;
        let mut frame = Frame::new(function, args);

        if is_async {
            let promise = self.scheduler.new_promise();
            self.drive_task(frame, promise.clone(), depth);
            return Ok(ScriptValue::Promise(promise));
        }

        match self.run(&mut frame, depth) {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(Flow::Await(_)) => Err(Exception::message("'await' outside of an async function")),
            Err(mut error) => {
                error.trace.push(name.to_string());
                Err(error)
            }
        }
    }

    fn call_value(
        &mut self,
        callee: ScriptValue,
        args: Vec<ScriptValue>,
        depth: usize,
    ) -> Result<ScriptValue, Exception> {
        match callee {
            ScriptValue::Function(name) => self.call_named(&name, args, depth),
            other => Err(Exception::message(format!("{} is not a function", other))),
        }
    }

    /// Run an async frame until it returns, throws or parks
    fn drive_task(&mut self, mut frame: Frame, promise: PromiseRef, depth: usize) {
        match self.run(&mut frame, depth) {
            Ok(Flow::Return(value)) => self.scheduler.resolve(&promise, value),
            Ok(Flow::Await(awaited)) => self.scheduler.suspend(Task { frame, promise }, &awaited),
            Err(mut error) => {
                error.trace.push(frame.name().to_string());
                self.scheduler.reject(&promise, error);
            }
        }
    }

    fn run(&mut self, frame: &mut Frame, depth: usize) -> Result<Flow, Exception> {
        let function = frame.function.clone();
        let code = &function.bytecode;

        while frame.pc < code.len() {
            let instruction = &code[frame.pc];
            frame.pc += 1;

            match instruction {
                Instruction::Push(constant) => frame.push(Self::constant(constant)),

                Instruction::Pop => {
                    frame.pop();
                }

                Instruction::LoadLocal(name) => {
                    let value = frame.locals.get(name).cloned().unwrap_or(ScriptValue::Null);
                    frame.push(value);
                }

                Instruction::StoreLocal(name) => {
                    let value = frame.pop();
                    frame.locals.insert(name.clone(), value);
                }

                Instruction::LoadFunction(name) => frame.push(ScriptValue::Function(name.clone())),

                Instruction::Add => {
                    let (a, b) = frame.pop2();
                    frame.push(Self::add(a, b));
                }

                Instruction::Sub => {
                    let (a, b) = frame.pop2();
                    frame.push(Self::sub(a, b));
                }

                Instruction::Mul => {
                    let (a, b) = frame.pop2();
                    frame.push(Self::mul(a, b));
                }

                Instruction::Div => {
                    let (a, b) = frame.pop2();
                    frame.push(Self::div(a, b));
                }

                Instruction::Mod => {
                    let (a, b) = frame.pop2();
                    frame.push(Self::modulo(a, b));
                }

                Instruction::Neg => {
                    let a = frame.pop();
                    frame.push(Self::neg(a));
                }

                Instruction::Eq => {
                    let (a, b) = frame.pop2();
                    frame.push(ScriptValue::Bool(a == b));
                }

                Instruction::Ne => {
                    let (a, b) = frame.pop2();
                    frame.push(ScriptValue::Bool(a != b));
                }

                Instruction::Gt => {
                    let (a, b) = frame.pop2();
                    frame.push(ScriptValue::Bool(Self::gt(&a, &b)));
                }

                Instruction::Gte => {
                    let (a, b) = frame.pop2();
                    frame.push(ScriptValue::Bool(Self::gt(&a, &b) || a == b));
                }

                Instruction::Lt => {
                    let (a, b) = frame.pop2();
                    frame.push(ScriptValue::Bool(Self::lt(&a, &b)));
                }

                Instruction::Lte => {
                    let (a, b) = frame.pop2();
                    frame.push(ScriptValue::Bool(Self::lt(&a, &b) || a == b));
                }

                Instruction::And => {
                    let (a, b) = frame.pop2();
                    frame.push(ScriptValue::Bool(a.truthy() && b.truthy()));
                }

                Instruction::Or => {
                    let (a, b) = frame.pop2();
                    frame.push(ScriptValue::Bool(a.truthy() || b.truthy()));
                }

                Instruction::Not => {
                    let a = frame.pop();
                    frame.push(ScriptValue::Bool(!a.truthy()));
                }

                Instruction::Jump(target) => frame.pc = *target,

                Instruction::JumpIfFalse(target) => {
                    if !frame.pop().truthy() {
                        frame.pc = *target;
                    }
                }

                Instruction::Return => return Ok(Flow::Return(frame.pop())),

                Instruction::Throw => return Err(Exception::new(frame.pop())),

                Instruction::Await => match frame.pop() {
                    ScriptValue::Promise(promise) => match promise.state() {
                        PromiseState::Pending => return Ok(Flow::Await(promise)),
                        PromiseState::Fulfilled(value) => frame.push(value),
                        PromiseState::Rejected(error) => return Err(error),
                    },
                    // awaiting a plain value yields it unchanged
                    other => frame.push(other),
                },

                Instruction::CallGlobal(name, arg_count) => {
                    let args = frame.pop_n(*arg_count);
                    let result = self.call_named(name, args, depth + 1)?;
                    frame.push(result);
                }

                Instruction::CallValue(arg_count) => {
                    let args = frame.pop_n(*arg_count);
                    let callee = frame.pop();
                    let result = self.call_value(callee, args, depth + 1)?;
                    frame.push(result);
                }

                Instruction::MethodCall(method, arg_count) => {
                    let args = frame.pop_n(*arg_count);
                    let object = frame.pop();
                    let result = Self::call_method(&object, method, args)?;
                    frame.push(result);
                }

                Instruction::MakeArray(count) => {
                    let items = frame.pop_n(*count);
                    frame.push(ScriptValue::array(items));
                }

                Instruction::MakeObject(count) => {
                    let flat = frame.pop_n(count * 2);
                    let object = ScriptValue::object(Vec::with_capacity(*count));
                    if let ScriptValue::Object(obj) = &object {
                        let mut flat = flat.into_iter();
                        while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                            object_set(obj, key, value);
                        }
                    }
                    frame.push(object);
                }

                Instruction::GetIndex => {
                    let (object, index) = frame.pop2();
                    frame.push(Self::get_index(&object, &index));
                }

                Instruction::SetIndex => {
                    let value = frame.pop();
                    let (object, index) = frame.pop2();
                    Self::set_index(&object, index, value)?;
                }

                Instruction::GetField(field) => {
                    let object = frame.pop();
                    frame.push(Self::get_field(&object, field));
                }

                Instruction::SetField(field) => {
                    let value = frame.pop();
                    match frame.pop() {
                        ScriptValue::Object(obj) => object_set(&obj, ScriptValue::str(field), value),
                        other => {
                            return Err(Exception::message(format!(
                                "cannot set field '{}' on {}",
                                field,
                                other.type_name()
                            )))
                        }
                    }
                }
            }
        }

        Ok(Flow::Return(ScriptValue::Null))
    }

    fn constant(constant: &Constant) -> ScriptValue {
        match constant {
            Constant::Null => ScriptValue::Null,
            Constant::Bool(b) => ScriptValue::Bool(*b),
            Constant::Int(n) => ScriptValue::Int(*n),
            Constant::Float(f) => ScriptValue::Float(*f),
            Constant::Str(s) => ScriptValue::Str(s.clone()),
        }
    }

    fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, Exception> {
        let mut args = args.into_iter();
        let first = args.next().unwrap_or(ScriptValue::Null);

        match builtin {
            Builtin::Sleep => {
                let ms = first.as_f64().filter(|ms| *ms > 0.0).unwrap_or(0.0);
                let deadline = Instant::now() + Duration::from_micros((ms * 1000.0) as u64);
                Ok(ScriptValue::Promise(self.scheduler.sleep(deadline)))
            }
            Builtin::Push => match first {
                ScriptValue::Array(arr) => {
                    let mut items = arr.lock();
                    items.push(args.next().unwrap_or(ScriptValue::Null));
                    Ok(ScriptValue::Int(items.len() as i64))
                }
                other => Err(Exception::message(format!(
                    "push expects an array, got {}",
                    other.type_name()
                ))),
            },
            Builtin::Len => Self::length(&first).ok_or_else(|| {
                Exception::message(format!("{} has no length", first.type_name()))
            }),
            Builtin::Str => Ok(ScriptValue::Str(first.to_display_string())),
        }
    }

    fn length(value: &ScriptValue) -> Option<ScriptValue> {
        let len = match value {
            ScriptValue::Array(arr) => arr.lock().len(),
            ScriptValue::Object(obj) => obj.lock().len(),
            ScriptValue::Str(s) => s.chars().count(),
            _ => return None,
        };
        Some(ScriptValue::Int(len as i64))
    }

    fn call_method(
        object: &ScriptValue,
        method: &str,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, Exception> {
        let arg = args.first().cloned().unwrap_or(ScriptValue::Null);

        match (object, method) {
            (_, "length") => Self::length(object).ok_or_else(|| {
                Exception::message(format!("{} has no length", object.type_name()))
            }),
            (ScriptValue::Array(arr), "includes") => {
                Ok(ScriptValue::Bool(arr.lock().iter().any(|item| *item == arg)))
            }
            (ScriptValue::Str(s), "includes") => match &arg {
                ScriptValue::Str(needle) => Ok(ScriptValue::Bool(s.contains(needle.as_str()))),
                _ => Ok(ScriptValue::Bool(false)),
            },
            (ScriptValue::Array(arr), "push") => {
                let mut items = arr.lock();
                items.extend(args);
                Ok(ScriptValue::Int(items.len() as i64))
            }
            (ScriptValue::Object(obj), "keys") => {
                let keys = obj.lock().iter().map(|(k, _)| k.clone()).collect();
                Ok(ScriptValue::array(keys))
            }
            _ => Err(Exception::message(format!(
                "{} has no method '{}'",
                object.type_name(),
                method
            ))),
        }
    }

    fn get_field(object: &ScriptValue, field: &str) -> ScriptValue {
        match object {
            ScriptValue::Object(obj) => object_get(obj, &ScriptValue::str(field)),
            ScriptValue::Array(_) | ScriptValue::Str(_) if field == "length" => {
                Self::length(object).unwrap_or(ScriptValue::Null)
            }
            _ => ScriptValue::Null,
        }
    }

    fn get_index(object: &ScriptValue, index: &ScriptValue) -> ScriptValue {
        match object {
            ScriptValue::Array(arr) => index
                .as_index()
                .and_then(|i| arr.lock().get(i).cloned())
                .unwrap_or(ScriptValue::Null),
            ScriptValue::Object(obj) => object_get(obj, index),
            ScriptValue::Str(s) => index
                .as_index()
                .and_then(|i| s.chars().nth(i))
                .map(|c| ScriptValue::Str(c.to_string()))
                .unwrap_or(ScriptValue::Null),
            _ => ScriptValue::Null,
        }
    }

    fn set_index(
        object: &ScriptValue,
        index: ScriptValue,
        value: ScriptValue,
    ) -> Result<(), Exception> {
        match object {
            ScriptValue::Array(arr) => {
                let Some(i) = index.as_index() else {
                    return Err(Exception::message(format!(
                        "{} cannot be used as an array index",
                        index.type_name()
                    )));
                };
                let mut items = arr.lock();
                let len = items.len();
                match i {
                    i if i < len => items[i] = value,
                    i if i == len => items.push(value),
                    _ => {
                        return Err(Exception::message(format!(
                            "index {} is out of bounds for an array of length {}",
                            i, len
                        )))
                    }
                }
                Ok(())
            }
            ScriptValue::Object(obj) if index.is_primitive() => {
                object_set(obj, index, value);
                Ok(())
            }
            ScriptValue::Object(_) => Err(Exception::message(format!(
                "{} cannot be used as an object key",
                index.type_name()
            ))),
            other => Err(Exception::message(format!(
                "cannot assign by index into {}",
                other.type_name()
            ))),
        }
    }

    // Arithmetic operations
    #[inline]
    fn add(a: ScriptValue, b: ScriptValue) -> ScriptValue {
        match (a, b) {
            (ScriptValue::Int(x), ScriptValue::Int(y)) => ScriptValue::Int(x.wrapping_add(y)),
            (ScriptValue::Float(x), ScriptValue::Float(y)) => ScriptValue::Float(x + y),
            (ScriptValue::Int(x), ScriptValue::Float(y)) => ScriptValue::Float(x as f64 + y),
            (ScriptValue::Float(x), ScriptValue::Int(y)) => ScriptValue::Float(x + y as f64),
            (ScriptValue::Str(mut x), y) => {
                x.push_str(&y.to_display_string());
                ScriptValue::Str(x)
            }
            (x, ScriptValue::Str(y)) => ScriptValue::Str(x.to_display_string() + &y),
            _ => ScriptValue::Null,
        }
    }

    #[inline]
    fn sub(a: ScriptValue, b: ScriptValue) -> ScriptValue {
        match (a, b) {
            (ScriptValue::Int(x), ScriptValue::Int(y)) => ScriptValue::Int(x.wrapping_sub(y)),
            (ScriptValue::Float(x), ScriptValue::Float(y)) => ScriptValue::Float(x - y),
            (ScriptValue::Int(x), ScriptValue::Float(y)) => ScriptValue::Float(x as f64 - y),
            (ScriptValue::Float(x), ScriptValue::Int(y)) => ScriptValue::Float(x - y as f64),
            _ => ScriptValue::Null,
        }
    }

    #[inline]
    fn mul(a: ScriptValue, b: ScriptValue) -> ScriptValue {
        match (a, b) {
            (ScriptValue::Int(x), ScriptValue::Int(y)) => ScriptValue::Int(x.wrapping_mul(y)),
            (ScriptValue::Float(x), ScriptValue::Float(y)) => ScriptValue::Float(x * y),
            (ScriptValue::Int(x), ScriptValue::Float(y)) => ScriptValue::Float(x as f64 * y),
            (ScriptValue::Float(x), ScriptValue::Int(y)) => ScriptValue::Float(x * y as f64),
            _ => ScriptValue::Null,
        }
    }

    #[inline]
    fn div(a: ScriptValue, b: ScriptValue) -> ScriptValue {
        match (a, b) {
            (ScriptValue::Int(x), ScriptValue::Int(y)) if y != 0 => {
                ScriptValue::Int(x.wrapping_div(y))
            }
            (ScriptValue::Float(x), ScriptValue::Float(y)) if y != 0.0 => ScriptValue::Float(x / y),
            (ScriptValue::Int(x), ScriptValue::Float(y)) if y != 0.0 => {
                ScriptValue::Float(x as f64 / y)
            }
            (ScriptValue::Float(x), ScriptValue::Int(y)) if y != 0 => {
                ScriptValue::Float(x / y as f64)
            }
            _ => ScriptValue::Null,
        }
    }

    #[inline]
    fn modulo(a: ScriptValue, b: ScriptValue) -> ScriptValue {
        match (a, b) {
            (ScriptValue::Int(x), ScriptValue::Int(y)) if y != 0 => {
                ScriptValue::Int(x.wrapping_rem(y))
            }
            _ => ScriptValue::Null,
        }
    }

    #[inline]
    fn neg(a: ScriptValue) -> ScriptValue {
        match a {
            ScriptValue::Int(x) => ScriptValue::Int(x.wrapping_neg()),
            ScriptValue::Float(x) => ScriptValue::Float(-x),
            _ => ScriptValue::Null,
        }
    }

    // Comparison operations
    #[inline]
    fn gt(a: &ScriptValue, b: &ScriptValue) -> bool {
        match (a, b) {
            (ScriptValue::Str(x), ScriptValue::Str(y)) => x > y,
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x > y,
                _ => false,
            },
        }
    }

    #[inline]
    fn lt(a: &ScriptValue, b: &ScriptValue) -> bool {
        match (a, b) {
            (ScriptValue::Str(x), ScriptValue::Str(y)) => x < y,
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x < y,
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{compiler, parser};

    fn vm(source: &str) -> Vm {
        let program = parser::parse(source).unwrap();
        Vm::new(compiler::compile(program).unwrap())
    }

    /// Run timers and ready tasks until `promise` settles
    fn settle(vm: &mut Vm, promise: &ScriptValue) -> PromiseState {
        let ScriptValue::Promise(p) = promise else {
            panic!("expected a promise, got {}", promise);
        };
        for _ in 0..200 {
            vm.run_pending(Instant::now());
            if !p.is_pending() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        p.state()
    }

    #[test]
    fn test_arithmetic_and_strings() {
        let mut vm = vm(r#"
            function f(a, b) { return a * 2 + b; }
            function g(name) { return "Hello " + name + "!"; }
            function h(x) { return x / 0; }
        "#);
        assert_eq!(vm.call("f", vec![3.into(), 1.into()]).unwrap(), ScriptValue::Int(7));
        assert_eq!(vm.call("f", vec![1.5.into(), 1.into()]).unwrap(), ScriptValue::Float(4.0));
        assert_eq!(vm.call("g", vec!["World".into()]).unwrap(), ScriptValue::str("Hello World!"));
        assert_eq!(vm.call("h", vec![1.into()]).unwrap(), ScriptValue::Null);
    }

    #[test]
    fn test_loops_and_arrays() {
        let mut vm = vm(r#"
            function range(n) {
                let out = [];
                let i = 0;
                while (i < n) {
                    push(out, i);
                    i = i + 1;
                }
                return out;
            }
        "#);
        let result = vm.call("range", vec![3.into()]).unwrap();
        assert_eq!(result.to_string(), "[0, 1, 2]");
    }

    #[test]
    fn test_objects_and_fields() {
        let mut vm = vm(r#"
            function make(v) {
                let o = { name: "x", 1: v };
                o.extra = [v, v];
                o["k"] = 3;
                return o;
            }
            function read(o) { return o.name + str(o[1]) + str(len(o)); }
        "#);
        let obj = vm.call("make", vec![true.into()]).unwrap();
        assert_eq!(obj.to_string(), r#"{"name": "x", 1: true, "extra": [true, true], "k": 3}"#);
        assert_eq!(vm.call("read", vec![obj]).unwrap(), ScriptValue::str("xtrue4"));
    }

    #[test]
    fn test_throw_records_trace() {
        let mut vm = vm(r#"
            function inner() { throw "boom"; }
            function outer() { return inner(); }
        "#);
        let err = vm.call("outer", vec![]).unwrap_err();
        assert_eq!(err.value, ScriptValue::str("boom"));
        assert_eq!(err.trace, vec!["inner".to_string(), "outer".to_string()]);
        assert_eq!(err.stack().unwrap(), "    at inner\n    at outer");
    }

    #[test]
    fn test_unknown_function_throws() {
        let mut vm = vm("function f() { return nope(1); }");
        let err = vm.call("f", vec![]).unwrap_err();
        assert_eq!(err.value, ScriptValue::str("nope is not a function"));
    }

    #[test]
    fn test_call_depth_is_bounded() {
        // executor threads get a large stack; give the test the same
        let handle = std::thread::Builder::new()
            .stack_size(8 * 1024 * 1024)
            .spawn(|| {
                let mut vm = vm("function down(n) { return down(n + 1); }");
                vm.call("down", vec![0.into()]).unwrap_err()
            })
            .unwrap();
        let err = handle.join().unwrap();
        assert!(err.value.to_display_string().contains("maximum call depth"));
        assert_eq!(err.trace.len(), MAX_CALL_DEPTH);
    }

    #[test]
    fn test_function_values() {
        let mut vm = vm(r#"
            function twice(f, x) { return f(f(x)); }
            function inc(x) { return x + 1; }
            function run() { return twice(inc, 5); }
        "#);
        assert_eq!(vm.call("run", vec![]).unwrap(), ScriptValue::Int(7));
    }

    #[test]
    fn test_async_without_await_settles_immediately() {
        let mut vm = vm("async function f(x) { return x * 2; }");
        let ScriptValue::Promise(p) = vm.call("f", vec![4.into()]).unwrap() else {
            panic!("expected a promise");
        };
        assert!(matches!(p.state(), PromiseState::Fulfilled(ScriptValue::Int(8))));
    }

    #[test]
    fn test_await_sleep_resumes() {
        let mut vm = vm(r#"
            async function slow(x) {
                await sleep(5);
                return x + 1;
            }
            async function chain() {
                let a = await slow(1);
                let b = await slow(a);
                return [a, b];
            }
        "#);
        let promise = vm.call("chain", vec![]).unwrap();
        let PromiseState::Fulfilled(value) = settle(&mut vm, &promise) else {
            panic!("chain did not fulfill");
        };
        assert_eq!(value.to_string(), "[2, 3]");
        assert_eq!(vm.scheduler().suspended_count(), 0);
    }

    #[test]
    fn test_async_rejection_propagates_through_await() {
        let mut vm = vm(r#"
            async function fail() {
                await sleep(1);
                throw "nope";
            }
            async function caller() { return await fail(); }
        "#);
        let promise = vm.call("caller", vec![]).unwrap();
        let PromiseState::Rejected(error) = settle(&mut vm, &promise) else {
            panic!("caller did not reject");
        };
        assert_eq!(error.value, ScriptValue::str("nope"));
        assert_eq!(error.trace, vec!["fail".to_string(), "caller".to_string()]);
    }

    #[test]
    fn test_methods() {
        let mut vm = vm(r#"
            function f(a) {
                a.push(4, 5);
                return [a.length(), a.includes(5), "abc".includes("b")];
            }
        "#);
        let arr = ScriptValue::array(vec![1.into()]);
        assert_eq!(vm.call("f", vec![arr]).unwrap().to_string(), "[3, true, true]");
    }
}
