//! # Stack Frames
//!
//! One frame per active function call on a work-item's stack: the program
//! counter, the register file, the formal-argument storage and the two
//! variable scopes (function-local and lexical argument block).
//!
//! ## Design
//!
//! The register file is a flat byte vector sized at frame creation from
//! the function's register table; typed access goes through a sealed
//! conversion trait so only plain-old-data types can be read out of it.
//! Condition registers (`$c0`..`$c7`) are modeled apart as booleans. The
//! lexical argument scope is a state machine with exactly two states, so
//! opening twice or closing while closed is a reportable protocol error
//! instead of silent scope leakage.

use std::sync::Arc;

use crate::code::Segment;
use crate::error::{EmuError, Result};
use crate::function::Function;
use crate::memory::GuestMemory;
use crate::segment::SegmentManager;
use crate::variable::{Variable, VariableScope};

/// Host-side hook invoked when the frame it is attached to returns.
pub type ReturnCallback = Box<dyn FnOnce(&mut GuestMemory) -> Result<()> + Send>;

/// The lexical call-argument scope of a frame.
#[derive(Debug)]
pub enum ArgumentScope {
    /// No argument block is open.
    Closed,
    /// An argument block is open; call-argument variables live here until
    /// the matching block end.
    Open {
        /// Bindings declared inside the block.
        scope: VariableScope,
        /// Arena backing those bindings.
        segment: SegmentManager,
    },
}

mod sealed {
    pub trait Sealed {}
}

/// Plain-old-data types that can live in the byte register file.
pub trait RegisterValue: sealed::Sealed + Copy {
    /// Width in bytes.
    const WIDTH: usize;
    /// Decode from little-endian bytes.
    fn from_bytes(bytes: &[u8]) -> Self;
    /// Encode to little-endian bytes.
    fn to_bytes(self, out: &mut [u8]);
}

macro_rules! register_value {
    ($($ty:ty),*) => {$(
        impl sealed::Sealed for $ty {}
        impl RegisterValue for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            fn from_bytes(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
            fn to_bytes(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

register_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// One activation record on a work-item's call stack.
pub struct StackFrame {
    /// The function this frame executes.
    pub(crate) function: Arc<Function>,
    /// Code-entry index of the next entry to execute. `None` once the
    /// cursor has run past the end of the body.
    pub(crate) pc: Option<usize>,
    registers: Vec<u8>,
    control_registers: [bool; Self::NUM_CONTROL_REGISTERS],
    /// Bindings for the function's formal arguments. The storage is owned
    /// by `function_arguments_segment` and freed with the frame.
    pub(crate) function_arguments: VariableScope,
    function_arguments_segment: SegmentManager,
    /// Lexical call-argument scope, open between arg-block directives.
    pub(crate) argument_scope: ArgumentScope,
    /// Function-body variable declarations. Storage may live in global,
    /// group or private memory; freeing is routed per binding.
    pub(crate) variable_scope: VariableScope,
    pub(crate) return_callback: Option<ReturnCallback>,
}

impl StackFrame {
    const NUM_CONTROL_REGISTERS: usize = 8;

    /// Create a frame for `function`, allocating its formal-argument
    /// storage from flat memory.
    pub fn new(function: Arc<Function>, memory: &mut GuestMemory) -> Result<Self> {
        let mut segment = SegmentManager::new(memory, function.argument_segment_size())?;
        let mut formals = VariableScope::new();
        for arg in function.arguments() {
            // Alignment is capped at the flat allocator's block alignment
            // so the arena size computed at load time stays sufficient.
            let offset = segment.allocate(arg.size(), arg.ty().size().min(8))?;
            formals.declare(Variable::new(
                arg.name(),
                arg.ty(),
                arg.dim(),
                segment.flat_address(offset),
                Segment::Arg,
                true,
            )?);
        }
        let register_size = function.register_size() as usize;
        Ok(Self {
            function,
            pc: Some(0),
            registers: vec![0; register_size],
            control_registers: [false; Self::NUM_CONTROL_REGISTERS],
            function_arguments: formals,
            function_arguments_segment: segment,
            argument_scope: ArgumentScope::Closed,
            variable_scope: VariableScope::new(),
            return_callback: None,
        })
    }

    /// The function this frame executes.
    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    /// Current code-entry index, or `None` past the end of the body.
    pub fn pc(&self) -> Option<usize> {
        self.pc
    }

    /// Move the cursor to an absolute code-entry index.
    pub fn set_pc(&mut self, index: Option<usize>) {
        self.pc = index;
    }

    /// Attach a host-side return hook.
    pub fn set_return_callback(&mut self, callback: ReturnCallback) {
        self.return_callback = Some(callback);
    }

    /// Read a typed value out of a named register.
    pub fn register<T: RegisterValue>(&self, name: &str) -> Result<T> {
        let offset = self.function.register_offset(name)? as usize;
        let bytes = self
            .registers
            .get(offset..offset + T::WIDTH)
            .ok_or_else(|| EmuError::UnknownRegister(name.to_owned()))?;
        Ok(T::from_bytes(bytes))
    }

    /// Write a typed value into a named register.
    pub fn set_register<T: RegisterValue>(&mut self, name: &str, value: T) -> Result<()> {
        let offset = self.function.register_offset(name)? as usize;
        let bytes = self
            .registers
            .get_mut(offset..offset + T::WIDTH)
            .ok_or_else(|| EmuError::UnknownRegister(name.to_owned()))?;
        value.to_bytes(bytes);
        Ok(())
    }

    /// Borrow a register's full storage, for wide (`$q`) payloads.
    pub fn register_bytes(&self, name: &str) -> Result<&[u8]> {
        let offset = self.function.register_offset(name)? as usize;
        let width = crate::function::register_width(name)
            .ok_or_else(|| EmuError::UnknownRegister(name.to_owned()))? as usize;
        self.registers
            .get(offset..offset + width)
            .ok_or_else(|| EmuError::UnknownRegister(name.to_owned()))
    }

    fn control_index(name: &str) -> Result<usize> {
        let index = name
            .strip_prefix("$c")
            .and_then(|digits| digits.parse::<usize>().ok())
            .filter(|&i| i < Self::NUM_CONTROL_REGISTERS);
        index.ok_or_else(|| EmuError::UnknownRegister(name.to_owned()))
    }

    /// Read a condition register (`$c0`..`$c7`).
    pub fn control_register(&self, name: &str) -> Result<bool> {
        Ok(self.control_registers[Self::control_index(name)?])
    }

    /// Write a condition register.
    pub fn set_control_register(&mut self, name: &str, value: bool) -> Result<()> {
        self.control_registers[Self::control_index(name)?] = value;
        Ok(())
    }

    /// Open the lexical argument scope with an arena of `size` bytes.
    ///
    /// Fails if a block is already open; argument blocks do not nest.
    pub fn start_argument_scope(&mut self, size: u32, memory: &mut GuestMemory) -> Result<()> {
        if matches!(self.argument_scope, ArgumentScope::Open { .. }) {
            return Err(EmuError::ProtocolViolation(
                "argument scope opened while another is open",
            ));
        }
        self.argument_scope = ArgumentScope::Open {
            scope: VariableScope::new(),
            segment: SegmentManager::new(memory, size)?,
        };
        Ok(())
    }

    /// Close the lexical argument scope, releasing its arena and dropping
    /// every binding declared inside it.
    pub fn close_argument_scope(&mut self, memory: &mut GuestMemory) -> Result<()> {
        match std::mem::replace(&mut self.argument_scope, ArgumentScope::Closed) {
            ArgumentScope::Open { mut segment, .. } => segment.release(memory),
            ArgumentScope::Closed => Err(EmuError::ProtocolViolation(
                "argument scope closed while none is open",
            )),
        }
    }

    /// Resolve a name against this frame's argument chain: the open
    /// argument scope first, then the function's formals. Returns the
    /// binding's flat address.
    pub fn resolve_argument(&self, name: &str) -> Result<u32> {
        if let ArgumentScope::Open { scope, .. } = &self.argument_scope {
            if let Some(var) = scope.get(name) {
                return Ok(var.address());
            }
        }
        Ok(self.function_arguments.require(name, "argument")?.address())
    }

    /// Release frame-owned arenas back to flat memory. Variables living in
    /// foreign segments are the caller's responsibility.
    pub fn release(&mut self, memory: &mut GuestMemory) -> Result<()> {
        if let ArgumentScope::Open { segment, .. } = &mut self.argument_scope {
            segment.release(memory)?;
        }
        self.argument_scope = ArgumentScope::Closed;
        self.function_arguments_segment.release(memory)
    }
}

impl std::fmt::Debug for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackFrame")
            .field("function", &self.function.name())
            .field("pc", &self.pc)
            .field("locals", &self.variable_scope.len())
            .finish()
    }
}
