//! # Decoded-Code Data Model
//!
//! Plain-data representation of a loaded kernel's code section, as produced
//! by the program loader. The loader (binary-format reader, disassembler)
//! lives outside this crate; it hands the core a vector of [`CodeEntry`]
//! values per function, and the core walks them with a simple index cursor.
//!
//! Instruction *semantics* also live outside this module: an instruction
//! entry is dispatched through the handler table in [`crate::isa`], which
//! treats the operand list as opaque payload.

use std::fmt;

use crate::error::{EmuError, Result};

/// A value type in the guest ISA's type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Signed 8-bit integer.
    S8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    S16,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 32-bit integer.
    S32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    S64,
    /// Unsigned 64-bit integer.
    U64,
    /// 16-bit float.
    F16,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 1-bit predicate (stored as one byte).
    B1,
    /// 8-bit bitstring.
    B8,
    /// 16-bit bitstring.
    B16,
    /// 32-bit bitstring.
    B32,
    /// 64-bit bitstring.
    B64,
    /// 128-bit bitstring (vector register payload).
    B128,
}

impl TypeKind {
    /// Storage size of one element of this type, in bytes.
    pub const fn size(self) -> u32 {
        match self {
            TypeKind::S8 | TypeKind::U8 | TypeKind::B1 | TypeKind::B8 => 1,
            TypeKind::S16 | TypeKind::U16 | TypeKind::F16 | TypeKind::B16 => 2,
            TypeKind::S32 | TypeKind::U32 | TypeKind::F32 | TypeKind::B32 => 4,
            TypeKind::S64 | TypeKind::U64 | TypeKind::F64 | TypeKind::B64 => 8,
            TypeKind::B128 => 16,
        }
    }

    /// Storage size of a `dim`-element array of this type.
    ///
    /// A `dim` of zero denotes a scalar. Declarations too large for the
    /// 32-bit address space are rejected instead of silently wrapping.
    pub fn array_size(self, dim: u64) -> Result<u32> {
        let overflow = EmuError::OutOfSpace {
            size: u32::MAX,
            alignment: self.size(),
        };
        let count = u32::try_from(dim.max(1)).map_err(|_| overflow)?;
        self.size().checked_mul(count).ok_or(EmuError::OutOfSpace {
            size: u32::MAX,
            alignment: self.size(),
        })
    }
}

/// A named memory segment with its own lifetime and visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// No segment. Operations against it fail.
    None,
    /// Flat addressing; addresses pass through untranslated.
    Flat,
    /// Process-global memory, shared by every work-item.
    Global,
    /// Read-only image/constant memory. Unsupported by this core.
    Readonly,
    /// Kernel-argument staging area, one per dispatch.
    Kernarg,
    /// Group-shared memory, one arena per work-group.
    Group,
    /// Call-argument staging area, frame-scoped.
    Arg,
    /// Per-work-item private memory.
    Private,
    /// Register-spill area. Unsupported by this core.
    Spill,
}

/// Opcodes of the guest ISA known to this core.
///
/// The enum is closed on purpose: dispatch goes through an exhaustive
/// lookup instead of an unchecked index into a function-pointer table, so
/// an opcode without a handler is a reportable error, not undefined
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    Add,
    And,
    AtomicNoRet,
    Barrier,
    Br,
    Call,
    Cbr,
    Cmp,
    CurrentWorkGroupSize,
    Cvt,
    GridSize,
    Ld,
    Lda,
    Mad,
    MemFence,
    Mov,
    Mul,
    Or,
    Ret,
    Shl,
    Shr,
    St,
    Sub,
    WorkItemAbsId,
    WorkItemId,
    WorkGroupId,
}

/// One operand of a decoded instruction.
///
/// The core does not interpret operands itself; it forwards them to the
/// registered instruction handler. The only exceptions are `Call`
/// operands, which the call/return protocol inspects to match actual
/// arguments against formals.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A register name, e.g. `"$s0"` or `"$c1"`.
    Register(String),
    /// An immediate value, zero-extended to 64 bits.
    Immediate(u64),
    /// A memory operand: segment plus optional symbol and byte offset.
    Address {
        /// Segment the address resolves in.
        segment: Segment,
        /// Symbol name, if the operand references a declared variable.
        symbol: Option<String>,
        /// Byte offset added to the resolved base.
        offset: u32,
    },
    /// A branch target, as a code-entry offset.
    Label(u32),
    /// A callee reference by function name.
    FunctionRef(String),
    /// An argument list for a call: names bound in the caller's open
    /// argument scope, in declaration order.
    ArgList(Vec<String>),
}

/// A decoded instruction: opcode, operation type, opaque operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    /// The operation.
    pub opcode: Opcode,
    /// The type the operation is performed at.
    pub ty: TypeKind,
    /// Operand list, interpreted by the instruction handler.
    pub operands: Vec<Operand>,
}

impl Inst {
    /// Create an instruction with no operands.
    pub fn nullary(opcode: Opcode, ty: TypeKind) -> Self {
        Self {
            opcode,
            ty,
            operands: Vec::new(),
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{:?}", self.opcode, self.ty)
    }
}

/// A variable declaration directive.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDecl {
    /// Declared name, e.g. `"%sum"`.
    pub name: String,
    /// Element type.
    pub ty: TypeKind,
    /// Array dimension; `0` means scalar and is normalized to `1`.
    pub dim: u64,
    /// Segment the variable lives in.
    pub segment: Segment,
}

impl VariableDecl {
    /// Total byte size of the declared storage.
    ///
    /// A `dim` of zero denotes a scalar and contributes a factor of one.
    pub fn byte_size(&self) -> Result<u32> {
        self.ty.array_size(self.dim)
    }
}

/// The payload of one code-section entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    /// An executable instruction.
    Instruction(Inst),
    /// Start of a call-argument block.
    ArgBlockStart,
    /// End of a call-argument block.
    ArgBlockEnd,
    /// A variable declaration.
    Variable(VariableDecl),
}

/// One entry of a function's code section.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeEntry {
    /// Byte offset of the entry within the code section, as recorded by
    /// the loader. Monotonically increasing within a function.
    pub offset: u32,
    /// The entry payload.
    pub kind: EntryKind,
}

impl CodeEntry {
    /// Whether this entry is an executable instruction (as opposed to a
    /// directive).
    pub fn is_instruction(&self) -> bool {
        matches!(self.kind, EntryKind::Instruction(_))
    }
}
