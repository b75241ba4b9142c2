//! # Variables and Variable Scopes
//!
//! Name-to-storage bindings layered over a memory segment (or over raw
//! flat memory, for GLOBAL variables). A scope is created per function
//! call, per lexical argument block, or per grid dispatch (kernel
//! arguments), and destroyed when that lifetime ends.

use std::collections::HashMap;

use crate::code::{Segment, TypeKind};
use crate::error::{EmuError, Result};

/// A single name-to-storage binding.
///
/// A *formal* variable aliases storage owned by someone else (a caller or
/// the host) and must never be freed through its binding; a non-formal
/// variable owns exactly one allocation which is freed exactly once when
/// its scope is torn down.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    ty: TypeKind,
    dim: u64,
    size: u32,
    /// Segment-local offset for segment-backed variables; a flat address
    /// for GLOBAL variables.
    address: u32,
    segment: Segment,
    is_formal: bool,
}

impl Variable {
    /// Create a binding. `dim == 0` is normalized to 1; a dimension too
    /// large for the 32-bit address space is rejected.
    pub fn new(
        name: impl Into<String>,
        ty: TypeKind,
        dim: u64,
        address: u32,
        segment: Segment,
        is_formal: bool,
    ) -> Result<Self> {
        let size = ty.array_size(dim)?;
        Ok(Self {
            name: name.into(),
            ty,
            dim: dim.max(1),
            size,
            address,
            segment,
            is_formal,
        })
    }

    /// Binding name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type.
    pub fn ty(&self) -> TypeKind {
        self.ty
    }

    /// Array dimension (at least 1).
    pub fn dim(&self) -> u64 {
        self.dim
    }

    /// Total storage size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Storage address: segment-local offset, or flat for GLOBAL.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Segment the storage lives in.
    pub fn segment(&self) -> Segment {
        self.segment
    }

    /// Whether this binding aliases storage it does not own.
    pub fn is_formal(&self) -> bool {
        self.is_formal
    }
}

/// A name → [`Variable`] binding table.
#[derive(Debug, Default)]
pub struct VariableScope {
    bindings: HashMap<String, Variable>,
}

impl VariableScope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a binding. Redeclaring a name replaces the old binding.
    pub fn declare(&mut self, variable: Variable) {
        self.bindings.insert(variable.name().to_owned(), variable);
    }

    /// Look up a binding by name.
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.bindings.get(name)
    }

    /// Look up a binding, failing with [`EmuError::MissingBinding`].
    ///
    /// `scope_name` labels the failing scope chain in the error.
    pub fn require(&self, name: &str, scope_name: &'static str) -> Result<&Variable> {
        self.bindings.get(name).ok_or_else(|| EmuError::MissingBinding {
            name: name.to_owned(),
            scope: scope_name,
        })
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the scope has no bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterate over the bindings in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.bindings.values()
    }

    /// Remove and yield every binding, leaving the scope empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Variable> + '_ {
        self.bindings.drain().map(|(_, v)| v)
    }
}
