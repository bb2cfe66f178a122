// src/async_bridge.rs
//! Asynchronous calls: continuation pairs, call handles and timeouts.
//!
//! A call handle starts `Pending` and moves to exactly one terminal state. The
//! transition is a single compare-and-swap, so whichever of the settlement or
//! the timeout gets there first owns the continuations; the loser is dropped.

use crate::dispatch::{CallTarget, Ticket};
use crate::host::{ModuleHost, Reply};
use crate::timer::{Timer, TimerKey};
use crate::value::Value;
use crate::DispatchError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

type Handler = Box<dyn FnOnce(Result<Value, DispatchError>) -> Value + Send>;

/// Lifecycle of an asynchronous call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
    Pending = 0,
    Resolved = 1,
    Rejected = 2,
    TimedOut = 3,
}

impl CallState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CallState::Resolved,
            2 => CallState::Rejected,
            3 => CallState::TimedOut,
            _ => CallState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != CallState::Pending
    }
}

/// Resolve/reject pair plus the user data handed to whichever fires.
///
/// The value a continuation returns is kept on the handle
/// (see [`CallHandle::continuation_value`]).
pub struct Continuations<U> {
    user_data: U,
    resolve: Box<dyn FnOnce(Value, U) -> Value + Send>,
    reject: Box<dyn FnOnce(Value, U) -> Value + Send>,
}

impl<U: Send + 'static> Continuations<U> {
    pub fn new(
        user_data: U,
        resolve: impl FnOnce(Value, U) -> Value + Send + 'static,
        reject: impl FnOnce(Value, U) -> Value + Send + 'static,
    ) -> Self {
        Self {
            user_data,
            resolve: Box::new(resolve),
            reject: Box::new(reject),
        }
    }

    fn into_handler(self) -> Handler {
        let Continuations {
            user_data,
            resolve,
            reject,
        } = self;

        Box::new(move |outcome| match outcome {
            Ok(value) => resolve(value, user_data),
            Err(error) => reject(rejection_value(&error), user_data),
        })
    }
}

impl Continuations<()> {
    /// Continuations that do nothing; the outcome is read from the handle
    pub fn noop() -> Self {
        Self::new((), |_, _| Value::Null, |_, _| Value::Null)
    }
}

/// Value handed to `reject`.
///
/// A native exception passes its thrown value through. Every other failure
/// becomes `{"kind": ..., "message": ...}`; a timeout has kind `"timeout"`.
pub fn rejection_value(error: &DispatchError) -> Value {
    match error {
        DispatchError::NativeException { payload, .. } => payload.clone(),
        other => Value::mapping([
            ("kind", Value::from(other.kind())),
            ("message", Value::String(other.to_string())),
        ]),
    }
}

struct Completion {
    outcome: Result<Value, DispatchError>,
    continued: Value,
}

struct CallShared {
    target: String,
    tag: Option<String>,
    arg_count: usize,
    state: AtomicU8,
    handler: Mutex<Option<Handler>>,
    ticket: Mutex<Option<Ticket>>,
    timeout: Mutex<Option<(Timer, TimerKey)>>,
    completion: Mutex<Option<Completion>>,
    done: Condvar,
}

impl CallShared {
    fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to a terminal state. Only the first caller wins.
    fn finish(&self, outcome: Result<Value, DispatchError>) -> bool {
        let next = match &outcome {
            Ok(_) => CallState::Resolved,
            Err(DispatchError::Timeout) => CallState::TimedOut,
            Err(_) => CallState::Rejected,
        };

        if self
            .state
            .compare_exchange(
                CallState::Pending as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let timeout = self.timeout.lock().take();
        if let Some((timer, key)) = timeout {
            timer.cancel(key);
        }
        drop(self.ticket.lock().take());

        debug!(call = %self.target, state = ?next, "call settled");

        let handler = self.handler.lock().take();
        let continued = match handler {
            Some(handler) => handler(outcome.clone()),
            None => Value::Null,
        };

        *self.completion.lock() = Some(Completion { outcome, continued });
        self.done.notify_all();
        true
    }
}

/// One in-flight asynchronous call
#[derive(Clone)]
pub struct CallHandle {
    shared: Arc<CallShared>,
}

impl CallHandle {
    /// Function name, or a description of the awaited pending value
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn tag(&self) -> Option<&str> {
        self.shared.tag.as_deref()
    }

    pub fn arg_count(&self) -> usize {
        self.shared.arg_count
    }

    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Outcome once the continuation has run, `None` before that
    pub fn outcome(&self) -> Option<Result<Value, DispatchError>> {
        self.shared
            .completion
            .lock()
            .as_ref()
            .map(|c| c.outcome.clone())
    }

    /// What the fired continuation returned
    pub fn continuation_value(&self) -> Option<Value> {
        self.shared
            .completion
            .lock()
            .as_ref()
            .map(|c| c.continued.clone())
    }

    /// Block until the call is terminal and its continuation has run.
    ///
    /// Must not be called from inside this handle's own continuation.
    pub fn wait(&self) -> Result<Value, DispatchError> {
        let mut completion = self.shared.completion.lock();
        loop {
            if let Some(done) = completion.as_ref() {
                return done.outcome.clone();
            }
            self.shared.done.wait(&mut completion);
        }
    }

    /// Like [`CallHandle::wait`], giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value, DispatchError>> {
        let deadline = Instant::now() + timeout;
        let mut completion = self.shared.completion.lock();
        while completion.is_none() {
            if self
                .shared
                .done
                .wait_until(&mut completion, deadline)
                .timed_out()
            {
                break;
            }
        }
        completion.as_ref().map(|c| c.outcome.clone())
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("target", &self.shared.target)
            .field("tag", &self.shared.tag)
            .field("arg_count", &self.shared.arg_count)
            .field("state", &self.state())
            .finish()
    }
}

/// Register the continuations, submit the call and arm the timeout
pub(crate) fn start<U: Send + 'static>(
    timer: &Timer,
    ticket: Ticket,
    host: &Arc<ModuleHost>,
    call: CallTarget,
    continuations: Continuations<U>,
    timeout: Option<Duration>,
) -> CallHandle {
    let shared = Arc::new(CallShared {
        target: call.label,
        tag: call.tag,
        arg_count: call.args.len(),
        state: AtomicU8::new(CallState::Pending as u8),
        handler: Mutex::new(Some(continuations.into_handler())),
        ticket: Mutex::new(Some(ticket)),
        timeout: Mutex::new(None),
        completion: Mutex::new(None),
        done: Condvar::new(),
    });

    debug!(
        call = %shared.target,
        module = %host.id(),
        args = shared.arg_count,
        "await submitted"
    );

    let settle = shared.clone();
    let job = host.submit(
        call.target,
        call.args,
        Reply::new(move |result| {
            if !settle.finish(result) {
                debug!(
                    call = %settle.target,
                    state = ?settle.state(),
                    "late settlement discarded"
                );
            }
        }),
    );

    let Some(timeout) = timeout else {
        return CallHandle { shared };
    };
    let Some(deadline) = Instant::now().checked_add(timeout) else {
        debug!(call = %shared.target, ?timeout, "timeout beyond the clock range, waiting without one");
        return CallHandle { shared };
    };

    let expired = shared.clone();
    let owner = Arc::downgrade(host);
    let key = timer.schedule(deadline, move || {
        if expired.finish(Err(DispatchError::Timeout)) {
            debug!(call = %expired.target, ?timeout, "call timed out");
            if let Some(host) = owner.upgrade() {
                host.cancel(job);
            }
        }
    });
    *shared.timeout.lock() = Some((timer.clone(), key));

    // Settled before the key was stored.
    if shared.state().is_terminal() {
        let armed = shared.timeout.lock().take();
        if let Some((timer, key)) = armed {
            timer.cancel(key);
        }
    }

    CallHandle { shared }
}
