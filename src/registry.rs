// src/registry.rs
//! Runtime registry: language tags to backends, and the modules loaded
//! through them.

use crate::host::{ExportSignature, HostSettings, LoadedRuntime, LoaderBackend, ModuleHost, ModuleId};
use crate::{LoadError, ResolveError};
use ahash::HashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A module running in one of the embedded runtimes
pub struct LoadedModule {
    id: ModuleId,
    tag: String,
    exports: Vec<ExportSignature>,
    host: Arc<ModuleHost>,
}

impl LoadedModule {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Export table: names, parameters and whether calls are deferred
    pub fn exports(&self) -> &[ExportSignature] {
        &self.exports
    }

    pub fn export_names(&self) -> Vec<&str> {
        self.exports.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn signature(&self, name: &str) -> Option<&ExportSignature> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn exports_name(&self, name: &str) -> bool {
        self.signature(name).is_some()
    }

    pub(crate) fn host(&self) -> &Arc<ModuleHost> {
        &self.host
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("exports", &self.exports)
            .finish()
    }
}

struct Modules {
    loaded: Vec<Arc<LoadedModule>>,
    closed: bool,
}

pub struct RuntimeRegistry {
    backends: RwLock<HashMap<String, Arc<dyn LoaderBackend>>>,
    /// Directories searched for relative `load_from_file` paths, per tag
    execution_paths: RwLock<HashMap<String, Vec<PathBuf>>>,
    /// One lock per tag so loads of a tag are serialized
    load_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    modules: RwLock<Modules>,
    next_id: AtomicU64,
    max_depth: usize,
    strict: bool,
}

impl RuntimeRegistry {
    pub fn new(max_depth: usize, strict: bool) -> Self {
        Self {
            backends: RwLock::new(HashMap::default()),
            execution_paths: RwLock::new(HashMap::default()),
            load_locks: Mutex::new(HashMap::default()),
            modules: RwLock::new(Modules {
                loaded: Vec::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            max_depth,
            strict,
        }
    }

    pub fn register(&self, tag: &str, backend: impl LoaderBackend) -> Result<(), LoadError> {
        let mut backends = self.backends.write();
        if backends.contains_key(tag) {
            return Err(LoadError::DuplicateTag(tag.to_string()));
        }
        info!(tag, backend = backend.name(), "backend registered");
        backends.insert(tag.to_string(), Arc::new(backend));
        Ok(())
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.backends.read().contains_key(tag)
    }

    /// Registered tags, sorted
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.backends.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn load_from_memory(&self, tag: &str, source: &str) -> Result<Arc<LoadedModule>, LoadError> {
        self.load_with(tag, |backend| backend.load_from_memory(source))
    }

    pub fn load_from_file(&self, tag: &str, paths: &[PathBuf]) -> Result<Arc<LoadedModule>, LoadError> {
        let located = self.locate(tag, paths);
        self.load_with(tag, |backend| backend.load_from_file(&located))
    }

    /// Add a directory searched for relative source paths loaded under `tag`.
    /// Directories are searched in the order they were added.
    pub fn add_execution_path(&self, tag: &str, dir: impl Into<PathBuf>) -> Result<(), LoadError> {
        if !self.is_registered(tag) {
            return Err(LoadError::UnknownTag(tag.to_string()));
        }

        let dir = dir.into();
        let mut paths = self.execution_paths.write();
        let dirs = paths.entry(tag.to_string()).or_default();
        if !dirs.contains(&dir) {
            info!(tag, path = %dir.display(), "execution path added");
            dirs.push(dir);
        }
        Ok(())
    }

    pub fn execution_paths(&self, tag: &str) -> Vec<PathBuf> {
        self.execution_paths
            .read()
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve relative paths against the tag's execution paths. A path found
    /// in none of them is passed on unchanged.
    fn locate(&self, tag: &str, paths: &[PathBuf]) -> Vec<PathBuf> {
        let dirs = self.execution_paths(tag);
        paths
            .iter()
            .map(|path| find_in(&dirs, path).unwrap_or_else(|| path.clone()))
            .collect()
    }

    pub fn load_from_package(&self, tag: &str, package: &[u8]) -> Result<Arc<LoadedModule>, LoadError> {
        self.load_with(tag, |backend| backend.load_from_package(package))
    }

    fn load_with(
        &self,
        tag: &str,
        load: impl FnOnce(&dyn LoaderBackend) -> Result<LoadedRuntime, LoadError>,
    ) -> Result<Arc<LoadedModule>, LoadError> {
        let backend = self
            .backends
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| LoadError::UnknownTag(tag.to_string()))?;

        let tag_lock = self
            .load_locks
            .lock()
            .entry(tag.to_string())
            .or_default()
            .clone();
        let _guard = tag_lock.lock();

        if self.modules.read().closed {
            return Err(LoadError::Closed);
        }

        let runtime = load(backend.as_ref())?;
        let exports = runtime.exports().to_vec();
        let id = ModuleId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let host = runtime.launch(HostSettings {
            id,
            tag: tag.to_string(),
            max_depth: self.max_depth,
        })?;

        let module = Arc::new(LoadedModule {
            id,
            tag: tag.to_string(),
            exports,
            host,
        });

        let mut modules = self.modules.write();
        if modules.closed {
            drop(modules);
            module.host.shutdown();
            return Err(LoadError::Closed);
        }
        modules.loaded.push(module.clone());

        info!(
            module = %id,
            tag,
            exports = module.exports.len(),
            "module loaded"
        );
        Ok(module)
    }

    /// Find the module that should serve `name`.
    ///
    /// Without a tag every module is scanned in load order and the first one
    /// exporting the name wins, unless strict resolution is on.
    pub fn resolve(&self, name: &str, tag: Option<&str>) -> Result<Arc<LoadedModule>, ResolveError> {
        if let Some(tag) = tag {
            if !self.is_registered(tag) {
                return Err(ResolveError::TagNotFound(tag.to_string()));
            }
        }

        let modules = self.modules.read();
        let mut candidates = modules
            .loaded
            .iter()
            .filter(|m| tag.map_or(true, |t| m.tag == t))
            .filter(|m| m.exports_name(name));

        let first = candidates
            .next()
            .ok_or_else(|| ResolveError::SymbolNotFound(name.to_string()))?;

        if self.strict {
            let others: Vec<ModuleId> = candidates.map(|m| m.id).collect();
            if !others.is_empty() {
                let mut ids = vec![first.id];
                ids.extend(others);
                return Err(ResolveError::Ambiguous {
                    name: name.to_string(),
                    modules: ids,
                });
            }
        }

        debug!(name, module = %first.id, tag = %first.tag, "resolved");
        Ok(first.clone())
    }

    /// Loaded module by id
    pub fn get(&self, id: ModuleId) -> Option<Arc<LoadedModule>> {
        self.modules
            .read()
            .loaded
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Loaded modules in load order
    pub fn modules(&self) -> Vec<Arc<LoadedModule>> {
        self.modules.read().loaded.clone()
    }

    /// Remove a module and stop its executor
    pub fn unload(&self, id: ModuleId) -> bool {
        let removed = {
            let mut modules = self.modules.write();
            let position = modules.loaded.iter().position(|m| m.id == id);
            position.map(|i| modules.loaded.remove(i))
        };

        match removed {
            Some(module) => {
                module.host.shutdown();
                info!(module = %id, tag = %module.tag, "module unloaded");
                true
            }
            None => false,
        }
    }

    /// Refuse further loads and stop every module executor
    pub(crate) fn shutdown(&self) {
        let drained = {
            let mut modules = self.modules.write();
            modules.closed = true;
            std::mem::take(&mut modules.loaded)
        };

        for module in drained {
            module.host.shutdown();
            debug!(module = %module.id, "module stopped");
        }
    }
}

fn find_in(dirs: &[PathBuf], path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        return None;
    }
    dirs.iter().map(|dir| dir.join(path)).find(|candidate| candidate.is_file())
}
