// src/dispatch.rs
//! Call dispatcher: resolve, hand the call to the module executor, block for
//! the terminal value.

use crate::host::{ModuleHost, Reply, Target};
use crate::marshal::MarshalError;
use crate::registry::RuntimeRegistry;
use crate::value::{FunctionRef, PendingRef, Value};
use crate::{DispatchError, MarshalSite};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::debug;

/// Admission control for calls, used by teardown to drain in-flight work
pub(crate) struct Gate {
    state: Mutex<GateState>,
    idle: Condvar,
}

struct GateState {
    closed: bool,
    in_flight: usize,
}

/// Proof that a call was admitted; dropping it marks the call terminal
pub(crate) struct Ticket {
    gate: Arc<Gate>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                closed: false,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn enter(self: &Arc<Self>) -> Result<Ticket, DispatchError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DispatchError::Closed);
        }
        state.in_flight += 1;
        Ok(Ticket { gate: self.clone() })
    }

    /// Refuse new calls. Returns false if the gate was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.closed, true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Block until no admitted call is left
    pub(crate) fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            self.idle.wait(&mut state);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.idle.notify_all();
        }
    }
}

/// A resolved call, ready for submission
#[derive(Debug)]
pub(crate) struct CallTarget {
    /// Name used in logs and on the call handle
    pub label: String,
    pub tag: Option<String>,
    pub target: Target,
    pub args: Vec<Value>,
}

pub(crate) fn call(
    registry: &RuntimeRegistry,
    gate: &Arc<Gate>,
    tag: Option<&str>,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, DispatchError> {
    let _ticket = gate.enter()?;
    let module = registry.resolve(name, tag)?;

    debug!(name, module = %module.id(), args = args.len(), "dispatching call");
    run_sync(module.host(), Target::Export(name.to_string()), args)
}

pub(crate) fn call_function(
    gate: &Arc<Gate>,
    func: &FunctionRef,
    args: Vec<Value>,
) -> Result<Value, DispatchError> {
    let _ticket = gate.enter()?;
    let host = function_host(func)?;

    debug!(function = %func, args = args.len(), "dispatching function call");
    run_sync(&host, Target::Function(func.handle()), args)
}

pub(crate) fn function_host(func: &FunctionRef) -> Result<Arc<ModuleHost>, DispatchError> {
    live_host(func.host(), func.module())
}

pub(crate) fn pending_host(pending: &PendingRef) -> Result<Arc<ModuleHost>, DispatchError> {
    live_host(pending.host(), pending.module())
}

fn live_host(
    host: Option<Arc<ModuleHost>>,
    module: crate::ModuleId,
) -> Result<Arc<ModuleHost>, DispatchError> {
    match host {
        Some(host) if host.is_alive() => Ok(host),
        _ => Err(DispatchError::MarshalFailed {
            site: MarshalSite::Callee,
            source: MarshalError::StaleReference { module },
        }),
    }
}

/// Submit a job and block until its reply arrives
fn run_sync(host: &ModuleHost, target: Target, args: Vec<Value>) -> Result<Value, DispatchError> {
    if host.is_executor_thread() {
        return Err(DispatchError::Reentrant {
            tag: host.tag().to_string(),
        });
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    host.submit(
        target,
        args,
        Reply::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    rx.recv().unwrap_or(Err(DispatchError::Closed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_gate_counts_tickets() {
        let gate = Arc::new(Gate::new());
        let a = gate.enter().unwrap();
        let b = gate.enter().unwrap();
        assert_eq!(gate.in_flight(), 2);

        drop(a);
        assert_eq!(gate.in_flight(), 1);

        assert!(gate.close());
        assert!(!gate.close());
        assert!(matches!(gate.enter(), Err(DispatchError::Closed)));

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_idle())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(b);
        waiter.join().unwrap();
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_stale_function_reference() {
        let func = FunctionRef::new(crate::ModuleId(3), "script", 1, None, Some(std::sync::Weak::new()));
        assert!(matches!(
            function_host(&func),
            Err(DispatchError::MarshalFailed {
                site: MarshalSite::Callee,
                source: MarshalError::StaleReference { .. }
            })
        ));
    }
}
