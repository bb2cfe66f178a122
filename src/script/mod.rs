// src/script/mod.rs
//! Built-in scripting language, registered under the `"script"` tag.
//!
//! A small dynamically typed language with integers, doubles, strings,
//! arrays, objects, first-class functions and `async`/`await`:
//!
//! ```text
//! function add(a, b) { return a + b; }
//!
//! async function later(x) {
//!     await sleep(10);
//!     return x * 2;
//! }
//! ```
//!
//! Every top-level function is exported. Source is parsed and compiled to
//! bytecode at load time; the bytecode can be saved as a package with
//! [`ScriptProgram::to_bytes`] and loaded later without the source.

pub mod compiler;
pub mod parser;
pub mod runtime;

use crate::host::{read_sources, ExportSignature, LoadedRuntime, LoaderBackend};
use crate::LoadError;
use ahash::HashSet;
use compiler::CompiledFunction;
use runtime::ScriptRuntime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Language tag of the script backend
pub const TAG: &str = "script";

/// Leading bytes of a compiled package
const PACKAGE_MAGIC: &[u8; 4] = b"pcs1";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Invalid package: {0}")]
    Package(String),
}

impl From<ScriptError> for LoadError {
    fn from(err: ScriptError) -> Self {
        LoadError::Syntax(err.to_string())
    }
}

/// A compiled script module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptProgram {
    functions: Vec<CompiledFunction>,
}

impl ScriptProgram {
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let ast = parser::parse(source)?;
        let functions = compiler::compile(ast)?;
        Ok(Self { functions })
    }

    /// Exported function names, in declaration order
    pub fn function_names(&self) -> Vec<String> {
        self.functions.iter().map(|f| f.name.clone()).collect()
    }

    pub fn signatures(&self) -> Vec<ExportSignature> {
        self.functions
            .iter()
            .map(|f| ExportSignature::new(f.name.clone(), f.params.clone(), f.is_async))
            .collect()
    }

    pub(crate) fn into_functions(self) -> Vec<CompiledFunction> {
        self.functions
    }

    /// Serialize to a package for [`crate::Bridge::load_from_package`]
    pub fn to_bytes(&self) -> Result<Vec<u8>, ScriptError> {
        let body = bincode::serialize(self).map_err(|e| ScriptError::Package(e.to_string()))?;
        let mut bytes = Vec::with_capacity(PACKAGE_MAGIC.len() + body.len());
        bytes.extend_from_slice(PACKAGE_MAGIC);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ScriptError> {
        let body = bytes
            .strip_prefix(PACKAGE_MAGIC.as_slice())
            .ok_or_else(|| ScriptError::Package("missing package header".to_string()))?;

        let program: ScriptProgram =
            bincode::deserialize(body).map_err(|e| ScriptError::Package(e.to_string()))?;

        let mut seen = HashSet::default();
        for func in &program.functions {
            if !seen.insert(func.name.as_str()) {
                return Err(ScriptError::Package(format!(
                    "function '{}' is defined more than once",
                    func.name
                )));
            }
        }

        Ok(program)
    }
}

/// Loader for the script language
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptBackend;

impl ScriptBackend {
    pub fn new() -> Self {
        ScriptBackend
    }

    fn launch(&self, program: ScriptProgram) -> LoadedRuntime {
        debug!(functions = program.functions.len(), "script program compiled");
        LoadedRuntime::new(ScriptRuntime::new(program))
    }
}

impl LoaderBackend for ScriptBackend {
    fn name(&self) -> &str {
        TAG
    }

    fn load_from_memory(&self, source: &str) -> Result<LoadedRuntime, LoadError> {
        Ok(self.launch(ScriptProgram::compile(source)?))
    }

    fn load_from_file(&self, paths: &[PathBuf]) -> Result<LoadedRuntime, LoadError> {
        let source = read_sources(paths)?;
        Ok(self.launch(ScriptProgram::compile(&source)?))
    }

    fn load_from_package(&self, package: &[u8]) -> Result<LoadedRuntime, LoadError> {
        Ok(self.launch(ScriptProgram::from_bytes(package)?))
    }
}
