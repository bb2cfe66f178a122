// src/lib.rs
//! # polycall
//!
//! A polyglot invocation bridge. Modules written for embedded language
//! runtimes are loaded into a [`Bridge`] and their exported functions are
//! called from Rust as if they were native, synchronously or through
//! resolve/reject continuations.
//!
//! ## Example
//!
//! ```rust
//! use polycall::{Bridge, BridgeConfig, Value};
//!
//! let bridge = Bridge::initialize(BridgeConfig::default()).unwrap();
//!
//! bridge
//!     .load_from_memory("script", "function add(a, b) { return a + b; }")
//!     .unwrap();
//!
//! let sum = bridge.call("add", vec![Value::Int(2), Value::Int(3)]).unwrap();
//! assert_eq!(sum, Value::Int(5));
//!
//! bridge.destroy();
//! ```

pub mod async_bridge;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod marshal;
pub mod mock;
pub mod registry;
pub mod script;
pub mod value;

mod timer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub use async_bridge::{CallHandle, CallState, Continuations};
pub use config::BridgeConfig;
pub use host::{ExportSignature, LoadedRuntime, LoaderBackend, ModuleId, Runtime};
pub use marshal::MarshalError;
pub use mock::MockBackend;
pub use registry::{LoadedModule, RuntimeRegistry};
pub use script::ScriptBackend;
pub use value::{FunctionRef, PendingRef, Value};

use dispatch::Gate;
use timer::Timer;

/// Errors raised while bringing a bridge up
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Failed to start {0} thread: {1}")]
    Thread(&'static str, String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors raised while registering backends or loading modules
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("No backend registered for language tag '{0}'")]
    UnknownTag(String),

    #[error("A backend is already registered for language tag '{0}'")]
    DuplicateTag(String),

    #[error("Failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Failed to start module executor: {0}")]
    Spawn(String),

    #[error("The bridge has been destroyed")]
    Closed,
}

/// Errors raised while resolving a function name to a loaded module
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("No backend registered for language tag '{0}'")]
    TagNotFound(String),

    #[error("No loaded module exports '{0}'")]
    SymbolNotFound(String),

    #[error("'{name}' is exported by more than one module: {modules:?}")]
    Ambiguous { name: String, modules: Vec<ModuleId> },
}

/// Where a marshaling failure happened during a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalSite {
    /// Zero-based argument position
    Argument(usize),
    ReturnValue,
    /// The function or pending reference being called
    Callee,
}

impl std::fmt::Display for MarshalSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarshalSite::Argument(i) => write!(f, "argument {}", i),
            MarshalSite::ReturnValue => write!(f, "return value"),
            MarshalSite::Callee => write!(f, "callee"),
        }
    }
}

/// Errors raised by a call, synchronous or asynchronous
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    ResolveFailed(#[from] ResolveError),

    #[error("Marshaling failed at {site}: {source}")]
    MarshalFailed {
        site: MarshalSite,
        #[source]
        source: MarshalError,
    },

    #[error("Native exception: {message}")]
    NativeException {
        message: String,
        stack: Option<String>,
        /// The thrown value itself
        payload: Value,
    },

    #[error("Call timed out")]
    Timeout,

    #[error("The module or bridge was shut down before the call completed")]
    Closed,

    #[error("Synchronous call into '{tag}' from its own executor thread")]
    Reentrant { tag: String },
}

impl DispatchError {
    /// Build a `NativeException` from a thrown value
    pub fn native(payload: Value, stack: Option<String>) -> Self {
        let message = match &payload {
            Value::String(s) => s.clone(),
            other => match other.get("message").and_then(Value::as_str) {
                Some(m) => m.to_string(),
                None => other.to_string(),
            },
        };
        DispatchError::NativeException {
            message,
            stack,
            payload,
        }
    }

    /// Short machine readable name of the error
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::ResolveFailed(_) => "resolve",
            DispatchError::MarshalFailed { .. } => "marshal",
            DispatchError::NativeException { .. } => "exception",
            DispatchError::Timeout => "timeout",
            DispatchError::Closed => "closed",
            DispatchError::Reentrant { .. } => "reentrant",
        }
    }
}

/// Process-scoped bridge state.
///
/// Everything goes through an explicit `Bridge` value; cloning it is cheap and
/// every clone talks to the same registry.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    registry: RuntimeRegistry,
    gate: Arc<Gate>,
    timer: Timer,
}

impl BridgeInner {
    /// Drain admitted calls, then stop executors and the timer
    fn teardown(&self) {
        self.gate.wait_idle();
        self.registry.shutdown();
        self.timer.shutdown();
        info!("bridge destroyed");
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.registry.shutdown();
        self.timer.shutdown();
    }
}

impl Bridge {
    /// Bring up a bridge: validate the configuration, start the timer thread
    /// and register the built-in backends.
    pub fn initialize(config: BridgeConfig) -> Result<Self, InitError> {
        config.validate()?;

        let timer = Timer::start()?;
        let registry = RuntimeRegistry::new(config.max_marshal_depth, config.strict_resolution);

        if config.register_builtin_backends {
            registry
                .register(script::TAG, ScriptBackend::new())
                .map_err(|e| InitError::Config(e.to_string()))?;
            registry
                .register(mock::TAG, MockBackend::new())
                .map_err(|e| InitError::Config(e.to_string()))?;
        }

        info!(
            max_depth = config.max_marshal_depth,
            strict = config.strict_resolution,
            "bridge initialized"
        );

        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                registry,
                gate: Arc::new(Gate::new()),
                timer,
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.inner.registry
    }

    pub fn is_closed(&self) -> bool {
        self.inner.gate.is_closed()
    }

    /// Register a loader backend under a language tag
    pub fn register(&self, tag: &str, backend: impl LoaderBackend) -> Result<(), LoadError> {
        if self.is_closed() {
            return Err(LoadError::Closed);
        }
        self.inner.registry.register(tag, backend)
    }

    pub fn load_from_memory(&self, tag: &str, source: &str) -> Result<Arc<LoadedModule>, LoadError> {
        if self.is_closed() {
            return Err(LoadError::Closed);
        }
        self.inner.registry.load_from_memory(tag, source)
    }

    /// Load a module from an ordered list of source files
    pub fn load_from_file<P: AsRef<Path>>(
        &self,
        tag: &str,
        paths: &[P],
    ) -> Result<Arc<LoadedModule>, LoadError> {
        if self.is_closed() {
            return Err(LoadError::Closed);
        }
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self.inner.registry.load_from_file(tag, &paths)
    }

    /// Add a directory searched for relative paths passed to
    /// [`Bridge::load_from_file`] under `tag`
    pub fn add_execution_path(&self, tag: &str, dir: impl AsRef<Path>) -> Result<(), LoadError> {
        if self.is_closed() {
            return Err(LoadError::Closed);
        }
        self.inner
            .registry
            .add_execution_path(tag, dir.as_ref().to_path_buf())
    }

    /// Load a precompiled package (see `ScriptProgram::to_bytes`)
    pub fn load_from_package(&self, tag: &str, package: &[u8]) -> Result<Arc<LoadedModule>, LoadError> {
        if self.is_closed() {
            return Err(LoadError::Closed);
        }
        self.inner.registry.load_from_package(tag, package)
    }

    /// Unload a module. Calls still queued on it fail with `DispatchError::Closed`
    /// and references into it become stale.
    pub fn unload(&self, id: ModuleId) -> bool {
        self.inner.registry.unload(id)
    }

    /// Loaded modules in load order
    pub fn modules(&self) -> Vec<Arc<LoadedModule>> {
        self.inner.registry.modules()
    }

    pub fn module(&self, id: ModuleId) -> Option<Arc<LoadedModule>> {
        self.inner.registry.get(id)
    }

    /// Signature of the export `name` would resolve to
    pub fn signature(&self, name: &str, tag: Option<&str>) -> Result<ExportSignature, ResolveError> {
        let module = self.inner.registry.resolve(name, tag)?;
        module
            .signature(name)
            .cloned()
            .ok_or_else(|| ResolveError::SymbolNotFound(name.to_string()))
    }

    pub fn resolve(&self, name: &str, tag: Option<&str>) -> Result<Arc<LoadedModule>, ResolveError> {
        self.inner.registry.resolve(name, tag)
    }

    /// Call an exported function, searching every loaded module in load order.
    ///
    /// Blocks until the function produced a terminal value. Deferred results
    /// are awaited inside the module's event loop.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        dispatch::call(&self.inner.registry, &self.inner.gate, None, name, args)
    }

    /// Call an exported function of a module loaded under `tag`
    pub fn call_in(&self, tag: &str, name: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        dispatch::call(&self.inner.registry, &self.inner.gate, Some(tag), name, args)
    }

    /// Call a function value previously returned by a module
    pub fn call_function(&self, func: &FunctionRef, args: Vec<Value>) -> Result<Value, DispatchError> {
        dispatch::call_function(&self.inner.gate, func, args)
    }

    /// Start a call and return immediately.
    ///
    /// Exactly one continuation fires once the call settles, or `reject` fires
    /// with a timeout sentinel when `timeout` (or the configured default)
    /// elapses first. Resolution failures are returned here, synchronously.
    pub fn await_call<U: Send + 'static>(
        &self,
        name: &str,
        args: Vec<Value>,
        continuations: Continuations<U>,
        timeout: Option<Duration>,
    ) -> Result<CallHandle, DispatchError> {
        self.start_await(None, name, args, continuations, timeout)
    }

    pub fn await_call_in<U: Send + 'static>(
        &self,
        tag: &str,
        name: &str,
        args: Vec<Value>,
        continuations: Continuations<U>,
        timeout: Option<Duration>,
    ) -> Result<CallHandle, DispatchError> {
        self.start_await(Some(tag), name, args, continuations, timeout)
    }

    /// Wait asynchronously for a pending value returned inside a call result
    pub fn await_pending<U: Send + 'static>(
        &self,
        pending: &PendingRef,
        continuations: Continuations<U>,
        timeout: Option<Duration>,
    ) -> Result<CallHandle, DispatchError> {
        let ticket = self.inner.gate.enter()?;
        let host = dispatch::pending_host(pending)?;
        let label = format!("<pending {}>", pending.id());

        Ok(async_bridge::start(
            &self.inner.timer,
            ticket,
            &host,
            dispatch::CallTarget {
                label,
                tag: Some(pending.tag().to_string()),
                target: host::Target::Deferred(pending.id()),
                args: Vec::new(),
            },
            continuations,
            self.effective_timeout(timeout),
        ))
    }

    /// Future-returning form of [`Bridge::call`]
    #[cfg(feature = "tokio")]
    pub async fn call_async(&self, name: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        let ticket = self.inner.gate.enter()?;
        let module = self.inner.registry.resolve(name, None)?;
        let (tx, rx) = tokio::sync::oneshot::channel();

        module.host().submit(
            host::Target::Export(name.to_string()),
            args,
            host::Reply::new(move |result| {
                let _ = tx.send(result);
                drop(ticket);
            }),
        );

        rx.await.unwrap_or(Err(DispatchError::Closed))
    }

    /// Tear the bridge down.
    ///
    /// New work is refused at once. The call then blocks until every in-flight
    /// call handle and synchronous call is terminal, and finally stops every
    /// module executor and the timer. Calling it again does nothing.
    ///
    /// Called from a continuation, the calling thread is one the drain depends
    /// on, so the call returns right away and a background thread finishes the
    /// teardown.
    pub fn destroy(&self) {
        if !self.inner.gate.close() {
            return;
        }
        info!(
            in_flight = self.inner.gate.in_flight(),
            "bridge destroying, draining in-flight calls"
        );

        if host::on_executor_thread() || self.inner.timer.is_timer_thread() {
            let inner = self.inner.clone();
            let spawned = std::thread::Builder::new()
                .name("polycall-teardown".to_string())
                .spawn(move || inner.teardown());
            if let Err(e) = spawned {
                warn!(error = %e, "failed to start teardown thread, executors stop when the bridge is dropped");
            }
            return;
        }

        self.inner.teardown();
    }

    fn effective_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout.or_else(|| self.inner.config.default_timeout())
    }

    fn start_await<U: Send + 'static>(
        &self,
        tag: Option<&str>,
        name: &str,
        args: Vec<Value>,
        continuations: Continuations<U>,
        timeout: Option<Duration>,
    ) -> Result<CallHandle, DispatchError> {
        let ticket = self.inner.gate.enter()?;
        let module = self.inner.registry.resolve(name, tag)?;

        Ok(async_bridge::start(
            &self.inner.timer,
            ticket,
            module.host(),
            dispatch::CallTarget {
                label: name.to_string(),
                tag: tag.map(str::to_string),
                target: host::Target::Export(name.to_string()),
                args,
            },
            continuations,
            self.effective_timeout(timeout),
        ))
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.inner.config)
            .field("modules", &self.inner.registry.modules().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
