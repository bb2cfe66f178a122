// src/marshal.rs
//! Shared pieces of the marshaling layer.
//!
//! Each embedded runtime converts between [`Value`] and its own native
//! representation (see [`crate::host::Runtime`]). This module holds what every
//! converter needs: the error taxonomy, the depth-bounded [`MarshalContext`]
//! that binds function and pending references to their owning module, and the
//! numeric rules for runtimes that only have double-precision numbers.

use crate::host::{DeferredId, ModuleHost, ModuleId};
use crate::value::{FunctionRef, PendingRef, Value};
use std::sync::Weak;
use thiserror::Error;

/// Default bound on container nesting during conversion
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Largest integer a double represents together with all its neighbours (2^53 - 1)
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Errors raised while converting values across the boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarshalError {
    #[error("{kind} values are not supported by the '{tag}' runtime")]
    Unsupported { kind: &'static str, tag: String },

    #[error("integer {value} cannot be represented exactly by the '{tag}' runtime")]
    Precision { value: i64, tag: String },

    #[error("nesting deeper than {depth} levels (cyclic native value?)")]
    Cyclic { depth: usize },

    #[error("reference into {module} is stale: the module is no longer loaded")]
    StaleReference { module: ModuleId },
}

/// Per-conversion state handed to a runtime's converters
pub struct MarshalContext {
    module: ModuleId,
    tag: String,
    owner: Option<Weak<ModuleHost>>,
    depth: usize,
    max_depth: usize,
    exposed: Vec<DeferredId>,
}

impl MarshalContext {
    pub(crate) fn for_host(
        module: ModuleId,
        tag: &str,
        owner: Weak<ModuleHost>,
        max_depth: usize,
    ) -> Self {
        Self {
            module,
            tag: tag.to_string(),
            owner: Some(owner),
            depth: 0,
            max_depth,
            exposed: Vec::new(),
        }
    }

    /// Context that is not attached to a module host.
    ///
    /// References produced through it never become stale. Runtime
    /// implementations use it to exercise their converters in isolation.
    pub fn standalone(tag: &str, max_depth: usize) -> Self {
        Self {
            module: ModuleId(0),
            tag: tag.to_string(),
            owner: None,
            depth: 0,
            max_depth,
            exposed: Vec::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Run `f` one container level deeper, failing once the bound is hit
    pub fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, MarshalError>,
    ) -> Result<T, MarshalError> {
        if self.depth >= self.max_depth {
            return Err(MarshalError::Cyclic {
                depth: self.max_depth,
            });
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    pub fn unsupported(&self, value: &Value) -> MarshalError {
        MarshalError::Unsupported {
            kind: value.kind(),
            tag: self.tag.clone(),
        }
    }

    /// Wrap a runtime-local function handle for the host
    pub fn function_ref(&self, handle: u64, name: Option<String>) -> Value {
        Value::Function(FunctionRef::new(
            self.module,
            &self.tag,
            handle,
            name,
            self.owner.clone(),
        ))
    }

    /// Wrap a runtime-local deferred id for the host
    pub fn pending_ref(&mut self, id: DeferredId) -> Value {
        self.exposed.push(id);
        Value::Pending(PendingRef::new(
            self.module,
            &self.tag,
            id,
            self.owner.clone(),
        ))
    }

    /// Deferred ids handed out since the last call
    pub(crate) fn take_exposed(&mut self) -> Vec<DeferredId> {
        std::mem::take(&mut self.exposed)
    }

    /// Runtime-local handle behind `func`, if it belongs to this module
    pub fn local_function(&self, func: &FunctionRef) -> Result<u64, MarshalError> {
        self.check_owner(func.module(), func.is_live(), "function")?;
        Ok(func.handle())
    }

    /// Runtime-local deferred id behind `pending`, if it belongs to this module
    pub fn local_deferred(&self, pending: &PendingRef) -> Result<DeferredId, MarshalError> {
        self.check_owner(pending.module(), pending.is_live(), "pending")?;
        Ok(pending.id())
    }

    fn check_owner(
        &self,
        module: ModuleId,
        live: bool,
        kind: &'static str,
    ) -> Result<(), MarshalError> {
        if !live {
            return Err(MarshalError::StaleReference { module });
        }
        if module != self.module {
            return Err(MarshalError::Unsupported {
                kind,
                tag: self.tag.clone(),
            });
        }
        Ok(())
    }
}

/// Convert an integer for a runtime whose only number type is a double
pub fn int_to_double(value: i64, tag: &str) -> Result<f64, MarshalError> {
    let double = value as f64;
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&value) || double as i128 == value as i128 {
        Ok(double)
    } else {
        Err(MarshalError::Precision {
            value,
            tag: tag.to_string(),
        })
    }
}

/// Read a double coming from a float-only runtime.
///
/// Integral doubles inside the safe range come back as `Int`, everything else
/// (fractions, huge magnitudes, NaN, infinities) stays `Float`.
pub fn double_to_value(double: f64) -> Value {
    if double.fract() == 0.0 && double.abs() <= MAX_SAFE_INTEGER as f64 {
        Value::Int(double as i64)
    } else {
        Value::Float(double)
    }
}
