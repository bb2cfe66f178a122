// src/script/runtime/scheduler.rs
//! Promises, suspended tasks and timers: the script runtime's event loop state

use super::value::ScriptValue;
use super::vm::{Exception, Frame};
use ahash::HashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(ScriptValue),
    Rejected(Exception),
}

enum Waiter {
    /// Suspended task to resume
    Task(u64),
    /// Promise that settles the same way
    Adopt(PromiseRef),
}

struct PromiseCell {
    state: PromiseState,
    waiters: Vec<Waiter>,
}

/// Shared handle to a promise
#[derive(Clone)]
pub struct PromiseRef {
    id: u64,
    cell: Arc<Mutex<PromiseCell>>,
}

impl PromiseRef {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PromiseState {
        self.cell.lock().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.cell.lock().state, PromiseState::Pending)
    }

    pub fn same(&self, other: &PromiseRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// An async function suspended at an `await`
pub struct Task {
    pub frame: Frame,
    pub promise: PromiseRef,
}

#[derive(Default)]
pub struct Scheduler {
    next_promise: u64,
    next_task: u64,
    next_timer: u64,
    suspended: HashMap<u64, Task>,
    ready: VecDeque<(u64, Result<ScriptValue, Exception>)>,
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    sleepers: HashMap<u64, PromiseRef>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            next_promise: 1,
            ..Self::default()
        }
    }

    pub fn new_promise(&mut self) -> PromiseRef {
        let id = self.next_promise;
        self.next_promise += 1;
        PromiseRef {
            id,
            cell: Arc::new(Mutex::new(PromiseCell {
                state: PromiseState::Pending,
                waiters: Vec::new(),
            })),
        }
    }

    /// Fulfill `promise`, adopting the state of `value` when it is a promise itself
    pub fn resolve(&mut self, promise: &PromiseRef, value: ScriptValue) {
        let inner = match value {
            ScriptValue::Promise(inner) => inner,
            other => return self.settle(promise, Ok(other)),
        };

        if inner.same(promise) {
            let error = Exception::message("promise resolved with itself");
            return self.settle(promise, Err(error));
        }

        let settled = {
            let mut cell = inner.cell.lock();
            match &cell.state {
                PromiseState::Pending => {
                    cell.waiters.push(Waiter::Adopt(promise.clone()));
                    None
                }
                PromiseState::Fulfilled(v) => Some(Ok(v.clone())),
                PromiseState::Rejected(e) => Some(Err(e.clone())),
            }
        };

        if let Some(outcome) = settled {
            self.settle(promise, outcome);
        }
    }

    pub fn reject(&mut self, promise: &PromiseRef, error: Exception) {
        self.settle(promise, Err(error));
    }

    fn settle(&mut self, promise: &PromiseRef, outcome: Result<ScriptValue, Exception>) {
        let mut pending = vec![(promise.clone(), outcome)];

        while let Some((promise, outcome)) = pending.pop() {
            let waiters = {
                let mut cell = promise.cell.lock();
                if !matches!(cell.state, PromiseState::Pending) {
                    continue;
                }
                cell.state = match &outcome {
                    Ok(v) => PromiseState::Fulfilled(v.clone()),
                    Err(e) => PromiseState::Rejected(e.clone()),
                };
                std::mem::take(&mut cell.waiters)
            };

            for waiter in waiters {
                match waiter {
                    Waiter::Task(task) => self.ready.push_back((task, outcome.clone())),
                    Waiter::Adopt(follower) => pending.push((follower, outcome.clone())),
                }
            }
        }
    }

    /// Park `task` until `awaited` settles
    pub fn suspend(&mut self, task: Task, awaited: &PromiseRef) {
        let id = self.next_task;
        self.next_task += 1;
        self.suspended.insert(id, task);

        let mut cell = awaited.cell.lock();
        match &cell.state {
            PromiseState::Pending => cell.waiters.push(Waiter::Task(id)),
            PromiseState::Fulfilled(v) => self.ready.push_back((id, Ok(v.clone()))),
            PromiseState::Rejected(e) => self.ready.push_back((id, Err(e.clone()))),
        }
    }

    /// Promise fulfilled with null at `deadline`
    pub fn sleep(&mut self, deadline: Instant) -> PromiseRef {
        let promise = self.new_promise();
        let key = self.next_timer;
        self.next_timer += 1;
        self.timers.push(Reverse((deadline, key)));
        self.sleepers.insert(key, promise.clone());
        promise
    }

    /// Settle every sleep whose deadline has passed
    pub fn fire_timers(&mut self, now: Instant) {
        while let Some(Reverse((deadline, key))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            if let Some(promise) = self.sleepers.remove(&key) {
                self.settle(&promise, Ok(ScriptValue::Null));
            }
        }
    }

    pub fn next_ready(&mut self) -> Option<(Task, Result<ScriptValue, Exception>)> {
        while let Some((id, outcome)) = self.ready.pop_front() {
            if let Some(task) = self.suspended.remove(&id) {
                return Some((task, outcome));
            }
        }
        None
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.ready.is_empty() {
            return Some(Instant::now());
        }
        self.timers.peek().map(|Reverse((deadline, _))| *deadline)
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_resolve_and_adopt() {
        let mut scheduler = Scheduler::new();
        let inner = scheduler.new_promise();
        let outer = scheduler.new_promise();
        assert_ne!(inner.id(), outer.id());

        scheduler.resolve(&outer, ScriptValue::Promise(inner.clone()));
        assert!(outer.is_pending());

        scheduler.resolve(&inner, ScriptValue::Int(5));
        assert!(matches!(outer.state(), PromiseState::Fulfilled(ScriptValue::Int(5))));
    }

    #[test]
    fn test_settles_once() {
        let mut scheduler = Scheduler::new();
        let p = scheduler.new_promise();

        scheduler.reject(&p, Exception::message("first"));
        scheduler.resolve(&p, ScriptValue::Int(1));

        let PromiseState::Rejected(e) = p.state() else {
            panic!("expected rejection");
        };
        assert_eq!(e.value, ScriptValue::str("first"));
    }

    #[test]
    fn test_self_resolution_rejects() {
        let mut scheduler = Scheduler::new();
        let p = scheduler.new_promise();
        scheduler.resolve(&p, ScriptValue::Promise(p.clone()));
        assert!(matches!(p.state(), PromiseState::Rejected(_)));
    }

    #[test]
    fn test_timers_fire_in_order() {
        let mut scheduler = Scheduler::new();
        let start = Instant::now();
        let late = scheduler.sleep(start + Duration::from_millis(50));
        let early = scheduler.sleep(start + Duration::from_millis(10));

        assert_eq!(scheduler.next_deadline(), Some(start + Duration::from_millis(10)));

        scheduler.fire_timers(start + Duration::from_millis(20));
        assert!(!early.is_pending());
        assert!(late.is_pending());

        scheduler.fire_timers(start + Duration::from_millis(50));
        assert!(!late.is_pending());
        assert_eq!(scheduler.next_deadline(), None);
    }
}
