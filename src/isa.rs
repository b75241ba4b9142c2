//! # Instruction Dispatch
//!
//! The execution environment handed to every instruction handler, and the
//! opcode-to-handler table wavefronts dispatch through.
//!
//! ## Design
//!
//! Handlers are boxed closures keyed by a closed opcode enum, so a missing
//! handler is a reported [`EmuError::UnimplementedOpcode`] rather than an
//! out-of-bounds jump through a function-pointer array. The table ships
//! with the control-flow and protocol opcodes built in; compute opcodes
//! are registered by the embedding simulator, which owns their semantics.

use std::collections::HashMap;

use crate::code::{Inst, Opcode, Operand};
use crate::emulator::EmuContext;
use crate::error::{EmuError, Result};
use crate::grid::GridEnv;
use crate::segment::SegmentManager;
use crate::work_item::WorkItem;

/// What the program counter does after a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstOutcome {
    /// Step to the next code entry.
    Advance,
    /// The handler already placed the cursor; leave it alone.
    Jump,
    /// Advance, then suspend the work-item at its group barrier.
    Barrier,
}

/// Mutable state an instruction handler may touch, scoped to one step of
/// one work-item.
pub struct ExecEnv<'a> {
    /// Shared emulator state: flat memory, configuration, counters.
    pub ctx: &'a mut EmuContext,
    /// The group-shared arena of the work-item's work-group.
    pub group_segment: &'a mut SegmentManager,
    /// Read-only view of the owning grid.
    pub grid: &'a GridEnv<'a>,
}

/// An instruction handler.
pub type InstHandler =
    Box<dyn Fn(&mut WorkItem, &Inst, &mut ExecEnv<'_>) -> Result<InstOutcome> + Send + Sync>;

/// Opcode-to-handler dispatch table.
pub struct HandlerTable {
    handlers: HashMap<Opcode, InstHandler>,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Create a table with the control-flow and protocol opcodes wired up:
    /// `Ret`, `Call`, `Barrier`, `Br`, `Cbr` and `MemFence`.
    pub fn with_core_ops() -> Self {
        let mut table = Self::new();

        table.register(Opcode::Ret, |item, _inst, env| {
            item.return_function(env)?;
            Ok(InstOutcome::Jump)
        });

        table.register(Opcode::Call, |item, inst, env| {
            let operands = crate::function::CallOperands::from_inst(inst)?;
            item.call(&operands, env)?;
            Ok(InstOutcome::Jump)
        });

        table.register(Opcode::Barrier, |_item, _inst, _env| Ok(InstOutcome::Barrier));

        table.register(Opcode::Br, |item, inst, _env| {
            let target = branch_target(inst, 0)?;
            item.jump_to_offset(target)?;
            Ok(InstOutcome::Jump)
        });

        table.register(Opcode::Cbr, |item, inst, _env| {
            let taken = match inst.operands.first() {
                Some(Operand::Register(name)) => item.control_register(name)?,
                _ => {
                    return Err(EmuError::ProtocolViolation(
                        "conditional branch without a condition register",
                    ))
                }
            };
            if taken {
                let target = branch_target(inst, 1)?;
                item.jump_to_offset(target)?;
                Ok(InstOutcome::Jump)
            } else {
                Ok(InstOutcome::Advance)
            }
        });

        // Single-threaded per work-group step loop; ordering is already
        // sequential, so a fence only advances.
        table.register(Opcode::MemFence, |_item, _inst, _env| Ok(InstOutcome::Advance));

        table
    }

    /// Register (or replace) the handler for an opcode.
    pub fn register<H>(&mut self, opcode: Opcode, handler: H)
    where
        H: Fn(&mut WorkItem, &Inst, &mut ExecEnv<'_>) -> Result<InstOutcome>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(opcode, Box::new(handler));
    }

    /// Look up the handler for an opcode.
    pub fn get(&self, opcode: Opcode) -> Option<&InstHandler> {
        self.handlers.get(&opcode)
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::with_core_ops()
    }
}

fn branch_target(inst: &Inst, operand_index: usize) -> Result<u32> {
    match inst.operands.get(operand_index) {
        Some(Operand::Label(offset)) => Ok(*offset),
        _ => Err(EmuError::ProtocolViolation(
            "branch instruction without a label operand",
        )),
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("opcodes", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::TypeKind;

    #[test]
    fn test_core_ops_present() {
        let table = HandlerTable::with_core_ops();
        for opcode in [
            Opcode::Ret,
            Opcode::Call,
            Opcode::Barrier,
            Opcode::Br,
            Opcode::Cbr,
            Opcode::MemFence,
        ] {
            assert!(table.get(opcode).is_some(), "{opcode:?} missing");
        }
        assert!(table.get(Opcode::Mad).is_none());
    }

    #[test]
    fn test_register_replaces() {
        let mut table = HandlerTable::new();
        table.register(Opcode::Mov, |_, _, _| Ok(InstOutcome::Advance));
        table.register(Opcode::Mov, |_, _, _| Ok(InstOutcome::Jump));
        assert!(table.get(Opcode::Mov).is_some());
        assert_eq!(table.handlers.len(), 1);
    }

    #[test]
    fn test_branch_target_extraction() {
        let inst = Inst {
            opcode: Opcode::Br,
            ty: TypeKind::B1,
            operands: vec![Operand::Label(16)],
        };
        assert_eq!(branch_target(&inst, 0).unwrap(), 16);
        assert!(branch_target(&inst, 1).is_err());
    }
}
