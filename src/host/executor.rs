// src/host/executor.rs
//! Per-module executor thread.
//!
//! The thread owns the runtime. Jobs arrive over a channel and are handled one
//! at a time, which is what serializes entry into a runtime that is not
//! re-entrant. Between jobs the thread drives the runtime's own scheduler so
//! deferred operations keep progressing while no host call is active.

use super::{Callee, DeferredId, Invoked, ModuleId, NativeHandle, Runtime, Settlement, Thrown};
use crate::marshal::MarshalContext;
use crate::value::Value;
use crate::{DispatchError, LoadError, MarshalSite};
use ahash::HashMap;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;
use tracing::{debug, warn};

/// Runtimes may recurse deeply while evaluating native code
const EXECUTOR_STACK_SIZE: usize = 8 * 1024 * 1024;

thread_local! {
    static ON_EXECUTOR: Cell<bool> = const { Cell::new(false) };
}

/// Whether the caller runs on any module's executor thread
pub(crate) fn on_executor_thread() -> bool {
    ON_EXECUTOR.with(Cell::get)
}

type ReplyFn = Box<dyn FnOnce(Result<Value, DispatchError>) + Send>;

/// Receives the terminal result of one job.
///
/// A reply that is dropped without being sent reports `DispatchError::Closed`,
/// so a caller is never left waiting on a module that went away.
pub(crate) struct Reply(Option<ReplyFn>);

impl Reply {
    pub(crate) fn new(f: impl FnOnce(Result<Value, DispatchError>) + Send + 'static) -> Self {
        Reply(Some(Box::new(f)))
    }

    pub(crate) fn send(mut self, result: Result<Value, DispatchError>) {
        if let Some(f) = self.0.take() {
            f(result);
        }
    }

    /// Drop the reply without reporting anything
    pub(crate) fn discard(mut self) {
        self.0.take();
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f(Err(DispatchError::Closed));
        }
    }
}

/// What a job runs
#[derive(Debug, Clone)]
pub(crate) enum Target {
    Export(String),
    Function(u64),
    /// Wait for a deferred value previously exposed as `Value::Pending`
    Deferred(DeferredId),
}

/// Identifies one submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct JobKey(u64);

enum Job {
    Invoke {
        key: JobKey,
        target: Target,
        args: Vec<Value>,
        reply: Reply,
    },
    Release(NativeHandle),
    /// The caller gave up on a job; drop its reply if it is still waiting
    Cancel(JobKey),
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct HostSettings {
    pub id: ModuleId,
    pub tag: String,
    pub max_depth: usize,
}

/// Running module: the handle the rest of the bridge talks to
pub struct ModuleHost {
    id: ModuleId,
    tag: String,
    sender: Sender<Job>,
    next_job: AtomicU64,
    alive: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
}

impl ModuleHost {
    pub(crate) fn spawn<R: Runtime>(
        runtime: R,
        settings: HostSettings,
    ) -> Result<Arc<Self>, LoadError> {
        let (sender, receiver) = crossbeam_channel::unbounded();

        let host = Arc::new(ModuleHost {
            id: settings.id,
            tag: settings.tag.clone(),
            sender,
            next_job: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            thread: Mutex::new(None),
            thread_id: OnceLock::new(),
        });

        let executor = Executor {
            runtime,
            receiver,
            owner: Arc::downgrade(&host),
            module: settings.id,
            tag: settings.tag.clone(),
            max_depth: settings.max_depth,
            waiting: HashMap::default(),
            retained: HashMap::default(),
            settled: HashMap::default(),
        };

        let handle = thread::Builder::new()
            .name(format!("polycall-{}-{}", settings.tag, settings.id.0))
            .stack_size(EXECUTOR_STACK_SIZE)
            .spawn(move || executor.run())
            .map_err(|e| LoadError::Spawn(e.to_string()))?;

        let _ = host.thread_id.set(handle.thread().id());
        *host.thread.lock() = Some(handle);

        Ok(host)
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Whether the caller is running on this module's executor thread
    pub(crate) fn is_executor_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    pub(crate) fn submit(&self, target: Target, args: Vec<Value>, reply: Reply) -> JobKey {
        let key = JobKey(self.next_job.fetch_add(1, Ordering::Relaxed));
        if !self.is_alive() {
            reply.send(Err(DispatchError::Closed));
            return key;
        }

        // A failed send hands the job back; dropping it fails the reply.
        let _ = self.sender.send(Job::Invoke {
            key,
            target,
            args,
            reply,
        });
        key
    }

    /// Forget the reply of a job whose caller no longer wants the result
    pub(crate) fn cancel(&self, key: JobKey) {
        if self.is_alive() {
            let _ = self.sender.send(Job::Cancel(key));
        }
    }

    pub(crate) fn release(&self, handle: NativeHandle) {
        if self.is_alive() {
            let _ = self.sender.send(Job::Release(handle));
        }
    }

    /// Stop the executor and wait for it to exit. Jobs still queued fail with
    /// `DispatchError::Closed`.
    pub(crate) fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(Job::Shutdown);

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Shut down from inside a continuation; the loop exits on its own.
            return;
        }
        if handle.join().is_err() {
            warn!(module = %self.id, tag = %self.tag, "executor thread panicked");
        }
    }
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct Executor<R: Runtime> {
    runtime: R,
    receiver: Receiver<Job>,
    owner: Weak<ModuleHost>,
    module: ModuleId,
    tag: String,
    max_depth: usize,
    /// Replies waiting on a deferred id
    waiting: HashMap<DeferredId, Vec<(JobKey, Reply)>>,
    /// Live `PendingRef` count per deferred id
    retained: HashMap<DeferredId, usize>,
    /// Outcomes of retained ids, kept until the host releases them
    settled: HashMap<DeferredId, Result<Value, DispatchError>>,
}

impl<R: Runtime> Executor<R> {
    fn run(mut self) {
        ON_EXECUTOR.with(|flag| flag.set(true));
        debug!(module = %self.module, tag = %self.tag, "executor started");

        loop {
            let job = match self.runtime.next_wakeup() {
                Some(deadline) => match self.receiver.recv_deadline(deadline) {
                    Ok(job) => Some(job),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.receiver.recv() {
                    Ok(job) => Some(job),
                    Err(_) => break,
                },
            };

            match job {
                Some(Job::Shutdown) => break,
                Some(Job::Invoke {
                    key,
                    target,
                    args,
                    reply,
                }) => self.invoke(key, target, args, reply),
                Some(Job::Release(handle)) => self.release(handle),
                Some(Job::Cancel(key)) => self.cancel(key),
                None => {}
            }

            self.drive();
        }

        let abandoned = self.receiver.try_iter().count();
        debug!(
            module = %self.module,
            pending = self.waiting.len(),
            abandoned,
            "executor stopped"
        );
    }

    fn context(&self) -> MarshalContext {
        MarshalContext::for_host(self.module, &self.tag, self.owner.clone(), self.max_depth)
    }

    fn invoke(&mut self, key: JobKey, target: Target, args: Vec<Value>, reply: Reply) {
        let callee = match &target {
            Target::Export(name) => Callee::Export(name),
            Target::Function(handle) => Callee::Function(*handle),
            Target::Deferred(id) => {
                self.await_deferred(key, *id, reply);
                return;
            }
        };

        let mut cx = self.context();
        let mut natives = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            match self.runtime.to_native(arg, &mut cx) {
                Ok(native) => natives.push(native),
                Err(source) => {
                    reply.send(Err(DispatchError::MarshalFailed {
                        site: MarshalSite::Argument(index),
                        source,
                    }));
                    return;
                }
            }
        }

        match self.runtime.invoke(callee, natives) {
            Ok(Invoked::Returned(native)) => {
                let result = self.export(&native);
                reply.send(result);
            }
            Ok(Invoked::Deferred(id)) => {
                debug!(module = %self.module, ?target, deferred = id, "call deferred");
                self.waiting.entry(id).or_default().push((key, reply));
            }
            Err(thrown) => {
                let error = self.exception(thrown);
                reply.send(Err(error));
            }
        }
    }

    fn await_deferred(&mut self, key: JobKey, id: DeferredId, reply: Reply) {
        if let Some(result) = self.settled.get(&id) {
            reply.send(result.clone());
        } else if self.retained.contains_key(&id) {
            self.waiting.entry(id).or_default().push((key, reply));
        } else {
            reply.send(Err(DispatchError::MarshalFailed {
                site: MarshalSite::Callee,
                source: crate::MarshalError::StaleReference {
                    module: self.module,
                },
            }));
        }
    }

    fn release(&mut self, handle: NativeHandle) {
        let NativeHandle::Deferred(id) = handle else {
            self.runtime.release(handle);
            return;
        };

        match self.retained.get_mut(&id) {
            Some(count) if *count > 1 => *count -= 1,
            _ => {
                self.retained.remove(&id);
                self.forget_if_unused(id);
            }
        }
    }

    fn cancel(&mut self, key: JobKey) {
        let found = self.waiting.iter_mut().find_map(|(id, replies)| {
            let index = replies.iter().position(|(k, _)| *k == key)?;
            Some((*id, replies.remove(index).1))
        });
        let Some((id, reply)) = found else {
            return;
        };

        reply.discard();
        if self.waiting.get(&id).is_some_and(Vec::is_empty) {
            self.waiting.remove(&id);
        }
        debug!(module = %self.module, deferred = id, "cancelled reply dropped");
        self.forget_if_unused(id);
    }

    /// Let the runtime drop a deferred value nobody holds or waits on
    fn forget_if_unused(&mut self, id: DeferredId) {
        if self.retained.contains_key(&id) || self.waiting.contains_key(&id) {
            return;
        }
        self.settled.remove(&id);
        self.runtime.release(NativeHandle::Deferred(id));
    }

    /// Convert a native result for the host
    fn export(&mut self, native: &R::Native) -> Result<Value, DispatchError> {
        let mut cx = self.context();
        let result = self.runtime.from_native(native, &mut cx);
        for id in cx.take_exposed() {
            *self.retained.entry(id).or_default() += 1;
        }
        result.map_err(|source| DispatchError::MarshalFailed {
            site: MarshalSite::ReturnValue,
            source,
        })
    }

    fn exception(&mut self, thrown: Thrown<R::Native>) -> DispatchError {
        let payload = match self.export(&thrown.value) {
            Ok(value) => value,
            Err(e) => Value::String(e.to_string()),
        };
        DispatchError::native(payload, thrown.stack)
    }

    fn drive(&mut self) {
        let settlements = self.runtime.poll(Instant::now());

        for Settlement { id, outcome } in settlements {
            let result = match outcome {
                Ok(native) => self.export(&native),
                Err(thrown) => Err(self.exception(thrown)),
            };

            if self.retained.contains_key(&id) {
                self.settled.insert(id, result.clone());
            }

            if let Some(replies) = self.waiting.remove(&id) {
                debug!(module = %self.module, deferred = id, ok = result.is_ok(), "deferred settled");
                for (_, reply) in replies {
                    reply.send(result.clone());
                }
                self.forget_if_unused(id);
            }
        }
    }
}
