// src/host/mod.rs
//! Embedding contract between the bridge core and a language runtime.
//!
//! A [`LoaderBackend`] turns source text, files or a package into a
//! [`LoadedRuntime`]. The registry then moves that runtime onto its own
//! executor thread ([`ModuleHost`]), which is the only place the runtime is
//! ever touched: arguments are converted, functions invoked and the runtime's
//! event loop driven there.

mod executor;

pub use executor::ModuleHost;
pub(crate) use executor::{on_executor_thread, HostSettings, Reply, Target};

use crate::marshal::{MarshalContext, MarshalError};
use crate::value::Value;
use crate::LoadError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Identifier of a loaded module, unique for the lifetime of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Callable export as reported by a runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSignature {
    pub name: String,
    /// Parameter names in declaration order
    pub params: Vec<String>,
    /// Calls produce a deferred value
    pub is_async: bool,
}

impl ExportSignature {
    pub fn new(name: impl Into<String>, params: Vec<String>, is_async: bool) -> Self {
        Self {
            name: name.into(),
            params,
            is_async,
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for ExportSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async {
            write!(f, "async ")?;
        }
        write!(f, "{}({})", self.name, self.params.join(", "))
    }
}

/// Runtime-local id of a deferred (promise-like) native value
pub type DeferredId = u64;

/// Native object the host holds a reference to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeHandle {
    Function(u64),
    Deferred(DeferredId),
}

/// What the host asks a runtime to invoke
#[derive(Debug, Clone, Copy)]
pub enum Callee<'a> {
    /// Exported function, by name
    Export(&'a str),
    /// Function handle previously handed out through [`MarshalContext::function_ref`]
    Function(u64),
}

/// Immediate result of an invocation
pub enum Invoked<N> {
    Returned(N),
    /// The call produced a deferred value; its settlement is reported by
    /// [`Runtime::poll`] under this id.
    Deferred(DeferredId),
}

/// Exception raised by native code
pub struct Thrown<N> {
    pub value: N,
    pub stack: Option<String>,
}

impl<N> Thrown<N> {
    pub fn new(value: N) -> Self {
        Self { value, stack: None }
    }
}

/// A deferred value that reached a terminal state
pub struct Settlement<N> {
    pub id: DeferredId,
    pub outcome: Result<N, Thrown<N>>,
}

/// An embedded runtime instance holding one loaded module.
///
/// All methods run on the module's executor thread, one at a time.
pub trait Runtime: Send + 'static {
    type Native;

    /// Callable exports, in declaration order
    fn exports(&self) -> Vec<ExportSignature>;

    fn to_native(
        &mut self,
        value: &Value,
        cx: &mut MarshalContext,
    ) -> Result<Self::Native, MarshalError>;

    fn from_native(
        &mut self,
        native: &Self::Native,
        cx: &mut MarshalContext,
    ) -> Result<Value, MarshalError>;

    fn invoke(
        &mut self,
        callee: Callee<'_>,
        args: Vec<Self::Native>,
    ) -> Result<Invoked<Self::Native>, Thrown<Self::Native>>;

    /// Run whatever work is due and report deferred values that settled.
    ///
    /// Every id returned by `invoke` or handed out through
    /// [`MarshalContext::pending_ref`] is reported exactly once.
    fn poll(&mut self, now: Instant) -> Vec<Settlement<Self::Native>>;

    /// When `poll` next has work to do, if ever
    fn next_wakeup(&self) -> Option<Instant>;

    /// The host dropped its last reference to a native object
    fn release(&mut self, handle: NativeHandle);
}

type Launcher = Box<dyn FnOnce(HostSettings) -> Result<Arc<ModuleHost>, LoadError> + Send>;

/// A runtime produced by a backend, not yet running
pub struct LoadedRuntime {
    exports: Vec<ExportSignature>,
    launch: Launcher,
}

impl LoadedRuntime {
    pub fn new<R: Runtime>(runtime: R) -> Self {
        let exports = runtime.exports();
        Self {
            exports,
            launch: Box::new(move |settings| ModuleHost::spawn(runtime, settings)),
        }
    }

    pub fn exports(&self) -> &[ExportSignature] {
        &self.exports
    }

    pub(crate) fn launch(self, settings: HostSettings) -> Result<Arc<ModuleHost>, LoadError> {
        (self.launch)(settings)
    }
}

impl fmt::Debug for LoadedRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedRuntime")
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

/// Loads modules for one language
pub trait LoaderBackend: Send + Sync + 'static {
    /// Human readable backend name, used in logs
    fn name(&self) -> &str;

    fn load_from_memory(&self, source: &str) -> Result<LoadedRuntime, LoadError>;

    /// Load from an ordered list of files. Files are concatenated in order.
    ///
    /// Relative paths have already been looked up in the tag's execution
    /// paths by the registry.
    fn load_from_file(&self, paths: &[PathBuf]) -> Result<LoadedRuntime, LoadError>;

    fn load_from_package(&self, _package: &[u8]) -> Result<LoadedRuntime, LoadError> {
        Err(LoadError::Unsupported(format!(
            "the {} backend cannot load packages",
            self.name()
        )))
    }
}

/// Read and concatenate source files in order
pub fn read_sources(paths: &[PathBuf]) -> Result<String, LoadError> {
    if paths.is_empty() {
        return Err(LoadError::Syntax("no source files given".to_string()));
    }

    let mut source = String::new();
    for path in paths {
        let text = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.clone(),
            message: e.to_string(),
        })?;
        source.push_str(&text);
        source.push('\n');
    }
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_display() {
        let sync = ExportSignature::new("three_str", vec!["a".into(), "b".into(), "c".into()], false);
        assert_eq!(sync.to_string(), "three_str(a, b, c)");
        assert_eq!(sync.arity(), 3);

        let deferred = ExportSignature::new("later", vec![], true);
        assert_eq!(deferred.to_string(), "async later()");
    }

    #[test]
    fn test_read_sources_reports_missing_file() {
        let missing = PathBuf::from("/nonexistent/polycall/source.txt");
        assert!(matches!(
            read_sources(&[missing.clone()]),
            Err(LoadError::Io { path, .. }) if path == missing
        ));
        assert!(matches!(read_sources(&[]), Err(LoadError::Syntax(_))));
    }
}
