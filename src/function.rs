//! # Functions and Executables
//!
//! Loaded-code metadata: per-function formal arguments, register layout and
//! code section, plus the executable-level symbol table that dispatch
//! packets resolve kernels through.
//!
//! ## Design
//!
//! Register names are resolved once at load time into byte offsets within a
//! frame's register file; at execution time a register access is a bounds-
//! checked slice into a flat byte vector, not a map lookup. The call
//! protocol (`pass_by_value` / `pass_back_by_value`) lives here with the
//! formal-argument metadata it interprets.

use std::collections::HashMap;
use std::sync::Arc;

use crate::code::{CodeEntry, Inst, Operand, TypeKind};
use crate::error::{EmuError, Result};
use crate::memory::GuestMemory;
use crate::segment::NULL_RESERVE;
use crate::variable::VariableScope;

fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Direction of a formal argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgDirection {
    /// Copied caller-to-callee before the call body runs.
    Input,
    /// Copied callee-to-caller when the callee returns.
    Output,
}

/// One formal argument of a function signature.
#[derive(Debug, Clone)]
pub struct FormalArgument {
    name: String,
    ty: TypeKind,
    dim: u64,
    size: u32,
    /// Packed byte offset within the host-visible argument image.
    offset: u32,
    direction: ArgDirection,
}

impl FormalArgument {
    /// Declared name.
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

    /// Total byte size.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Packed byte offset within the argument image.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Whether this is an input or an output argument.
    pub fn direction(&self) -> ArgDirection {
        self.direction
    }
}

/// A loaded function: signature, register layout, code section.
#[derive(Debug)]
pub struct Function {
    name: String,
    code: Vec<CodeEntry>,
    /// Index of the last code entry, or `None` for an empty body.
    last_entry: Option<usize>,
    arguments: Vec<FormalArgument>,
    /// Packed size of the argument image (inputs and outputs, no padding
    /// beyond natural alignment of the packing walk).
    argument_size: u32,
    /// Arena size a frame must reserve so every formal fits after the
    /// reserved-null prefix and natural-alignment carving.
    argument_segment_size: u32,
    registers: HashMap<String, u32>,
    register_size: u32,
}

impl Function {
    /// Function name as recorded in the executable's symbol table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The formal arguments, in declaration order.
    pub fn arguments(&self) -> &[FormalArgument] {
        &self.arguments
    }

    /// Look up a formal argument by name.
    pub fn argument(&self, name: &str) -> Option<&FormalArgument> {
        self.arguments.iter().find(|a| a.name() == name)
    }

    /// Packed byte size of the argument image.
    pub fn argument_size(&self) -> u32 {
        self.argument_size
    }

    /// Arena size a frame reserves for its formal-argument storage.
    pub fn argument_segment_size(&self) -> u32 {
        self.argument_segment_size
    }

    /// Byte size of the register file a frame of this function needs.
    pub fn register_size(&self) -> u32 {
        self.register_size
    }

    /// Resolve a register name to its byte offset in the register file.
    pub fn register_offset(&self, name: &str) -> Result<u32> {
        self.registers
            .get(name)
            .copied()
            .ok_or_else(|| EmuError::UnknownRegister(name.to_owned()))
    }

    /// The code entry at the given index, if any.
    pub fn entry(&self, index: usize) -> Option<&CodeEntry> {
        self.code.get(index)
    }

    /// Index of the last code entry, or `None` for an empty body.
    pub fn last_entry(&self) -> Option<usize> {
        self.last_entry
    }

    /// Number of code entries.
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Find the index of the code entry at the given section byte offset.
    pub fn entry_at_offset(&self, offset: u32) -> Option<usize> {
        self.code.iter().position(|e| e.offset == offset)
    }
}

/// Storage width of a register name, from its class prefix.
///
/// `$c` registers are 1-bit condition flags and live outside the byte
/// register file, so they have no width here.
pub fn register_width(name: &str) -> Option<u32> {
    match name.as_bytes().get(1) {
        Some(b's') => Some(4),
        Some(b'd') => Some(8),
        Some(b'q') => Some(16),
        _ => None,
    }
}

/// Incremental builder for a [`Function`].
///
/// The loader drives this: declare formals and registers as the directives
/// are decoded, append code entries in section order, then `build`.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    code: Vec<CodeEntry>,
    arguments: Vec<FormalArgument>,
    registers: HashMap<String, u32>,
    register_size: u32,
}

impl FunctionBuilder {
    /// Start building a function with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Vec::new(),
            arguments: Vec::new(),
            registers: HashMap::new(),
            register_size: 0,
        }
    }

    /// Declare an input formal argument.
    pub fn input_arg(self, name: impl Into<String>, ty: TypeKind, dim: u64) -> Self {
        self.formal(name, ty, dim, ArgDirection::Input)
    }

    /// Declare an output formal argument.
    pub fn output_arg(self, name: impl Into<String>, ty: TypeKind, dim: u64) -> Self {
        self.formal(name, ty, dim, ArgDirection::Output)
    }

    fn formal(
        mut self,
        name: impl Into<String>,
        ty: TypeKind,
        dim: u64,
        direction: ArgDirection,
    ) -> Self {
        let dim = dim.max(1);
        self.arguments.push(FormalArgument {
            name: name.into(),
            ty,
            dim,
            size: ty.size() * dim as u32,
            offset: 0, // assigned by build()
            direction,
        });
        self
    }

    /// Declare a register. Width comes from the name's class prefix;
    /// condition registers (`$c`) are not part of the byte register file
    /// and are ignored here.
    pub fn register(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if let Some(width) = register_width(&name) {
            let offset = align_up(self.register_size, width);
            self.registers.insert(name, offset);
            self.register_size = offset + width;
        }
        self
    }

    /// Append a code entry. Section offsets are assigned in append order,
    /// four bytes apart, matching what a loader records for fixed-width
    /// encodings.
    pub fn entry(mut self, kind: crate::code::EntryKind) -> Self {
        let offset = self.code.len() as u32 * 4;
        self.code.push(CodeEntry { offset, kind });
        self
    }

    /// Finalize the function: assign packed argument offsets and compute
    /// the argument arena size.
    pub fn build(mut self) -> Function {
        // Packed image offsets, natural alignment.
        let mut packed = 0u32;
        for arg in &mut self.arguments {
            packed = align_up(packed, arg.ty.size());
            arg.offset = packed;
            packed += arg.size;
        }

        // Replay the arena allocation walk a frame performs, so the arena
        // is sized exactly for the reserved prefix plus alignment carving.
        let segment_size = if self.arguments.is_empty() {
            0
        } else {
            let mut cursor = NULL_RESERVE;
            for arg in &self.arguments {
                cursor = align_up(cursor, arg.ty.size());
                cursor += arg.size;
            }
            cursor
        };

        let last_entry = self.code.len().checked_sub(1);
        Function {
            name: self.name,
            code: self.code,
            last_entry,
            arguments: self.arguments,
            argument_size: packed,
            argument_segment_size: segment_size,
            registers: self.registers,
            register_size: self.register_size,
        }
    }
}

/// The call-site operand lists extracted from a `Call` instruction.
#[derive(Debug, Clone, Default)]
pub struct CallOperands {
    /// Callee name.
    pub callee: String,
    /// Names of the caller-scope variables bound to input formals, in
    /// callee declaration order.
    pub inputs: Vec<String>,
    /// Names bound to output formals, same ordering rule.
    pub outputs: Vec<String>,
}

impl CallOperands {
    /// Extract the operand lists from a decoded `Call` instruction.
    ///
    /// The encoding puts the output list before the input list, mirroring
    /// the assembly syntax `call &f (outs) (ins)`.
    pub fn from_inst(inst: &Inst) -> Result<Self> {
        let mut callee = None;
        let mut lists: Vec<&Vec<String>> = Vec::new();
        for op in &inst.operands {
            match op {
                Operand::FunctionRef(name) => callee = Some(name.clone()),
                Operand::ArgList(names) => lists.push(names),
                _ => {}
            }
        }
        let callee = callee.ok_or(EmuError::ProtocolViolation(
            "call instruction carries no function reference",
        ))?;
        let (outputs, inputs) = match lists.len() {
            0 => (Vec::new(), Vec::new()),
            1 => (lists[0].clone(), Vec::new()),
            _ => (lists[0].clone(), lists[1].clone()),
        };
        Ok(Self {
            callee,
            inputs,
            outputs,
        })
    }
}

/// Copy actual-argument bytes from the caller's bindings into the callee's
/// formal storage, before the callee body runs.
///
/// Input formals are matched positionally against `operands.inputs`; each
/// actual name resolves through the caller's scope chain (open argument
/// scope first, then its own formals).
pub fn pass_by_value(
    caller_lookup: &dyn Fn(&str) -> Result<u32>,
    callee_formals: &VariableScope,
    callee: &Function,
    operands: &CallOperands,
    memory: &mut GuestMemory,
) -> Result<()> {
    let inputs: Vec<&FormalArgument> = callee
        .arguments()
        .iter()
        .filter(|a| a.direction() == ArgDirection::Input)
        .collect();
    if inputs.len() != operands.inputs.len() {
        return Err(EmuError::ProtocolViolation(
            "call input count does not match callee signature",
        ));
    }
    for (formal, actual_name) in inputs.iter().zip(&operands.inputs) {
        let src = caller_lookup(actual_name)?;
        let dst_var = callee_formals.require(formal.name(), "callee formal")?;
        memory.copy(dst_var.address(), src, formal.size())?;
    }
    Ok(())
}

/// Copy output-formal bytes back into the caller's bindings when the
/// callee returns.
pub fn pass_back_by_value(
    caller_lookup: &dyn Fn(&str) -> Result<u32>,
    callee_formals: &VariableScope,
    callee: &Function,
    operands: &CallOperands,
    memory: &mut GuestMemory,
) -> Result<()> {
    let outputs: Vec<&FormalArgument> = callee
        .arguments()
        .iter()
        .filter(|a| a.direction() == ArgDirection::Output)
        .collect();
    if outputs.len() != operands.outputs.len() {
        return Err(EmuError::ProtocolViolation(
            "call output count does not match callee signature",
        ));
    }
    for (formal, actual_name) in outputs.iter().zip(&operands.outputs) {
        let dst = caller_lookup(actual_name)?;
        let src_var = callee_formals.require(formal.name(), "callee formal")?;
        memory.copy(dst, src_var.address(), formal.size())?;
    }
    Ok(())
}

/// A loaded executable: the function symbol table plus opaque kernel
/// handles for host-side dispatch packets.
#[derive(Debug, Default)]
pub struct Executable {
    functions: HashMap<String, Arc<Function>>,
    handles: HashMap<u64, String>,
    next_handle: u64,
}

impl Executable {
    /// Create an empty executable.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            handles: HashMap::new(),
            // Handle zero is reserved as "no kernel".
            next_handle: 1,
        }
    }

    /// Register a function and return its opaque kernel handle.
    pub fn add_function(&mut self, function: Function) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, function.name().to_owned());
        self.functions
            .insert(function.name().to_owned(), Arc::new(function));
        handle
    }

    /// Look up a function by name.
    pub fn function(&self, name: &str) -> Result<Arc<Function>> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| EmuError::UnresolvedSymbol(name.to_owned()))
    }

    /// Resolve a dispatch packet's kernel-object handle to a function.
    pub fn function_by_handle(&self, handle: u64) -> Result<Arc<Function>> {
        let name = self
            .handles
            .get(&handle)
            .ok_or_else(|| EmuError::UnresolvedSymbol(format!("kernel handle {handle}")))?;
        self.function(name)
    }
}
