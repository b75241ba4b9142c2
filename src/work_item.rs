//! # Work-Items
//!
//! The smallest unit of execution: one lane of a wavefront, with its own
//! call stack and private-memory arena. A work-item steps one code entry
//! at a time; the wavefront above it decides scheduling and the group
//! above that decides barrier rendezvous.
//!
//! ## Design
//!
//! Directives (variable declarations, argument-block brackets) execute
//! here because they touch frame and scope state; instruction semantics
//! are dispatched through the handler table so the core stays agnostic of
//! compute opcodes. The cursor is an index into the decoded code vector;
//! running it past the last entry is an implicit return, so a function
//! without a trailing `ret` still unwinds correctly.

use std::sync::Arc;

use crate::code::{EntryKind, Opcode, Segment};
use crate::error::{EmuError, Result};
use crate::frame::{ArgumentScope, StackFrame};
use crate::function::{pass_back_by_value, pass_by_value, CallOperands, Function};
use crate::isa::{ExecEnv, HandlerTable, InstOutcome};
use crate::memory::{align_up, GuestMemory};
use crate::segment::{SegmentManager, NULL_RESERVE};
use crate::variable::Variable;

/// Scheduling status of a work-item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemStatus {
    /// Eligible to step.
    Active,
    /// Held at a group barrier until every sibling arrives.
    Suspended,
}

/// What one call to [`WorkItem::execute`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The item stepped (or is suspended) and has more work.
    Active,
    /// The item just arrived at a barrier and suspended itself.
    Barrier,
    /// The item's call stack is empty; it is done.
    Finished,
}

/// One lane of execution within a work-group.
pub struct WorkItem {
    abs_id: [u32; 3],
    local_id: [u32; 3],
    group_id: [u32; 3],
    flat_local_id: u32,
    abs_flat_id: u64,
    status: WorkItemStatus,
    stack: Vec<StackFrame>,
    private_segment: SegmentManager,
}

impl WorkItem {
    /// Create a work-item at the given absolute grid position, with a
    /// kernel frame for `root` on its stack.
    pub fn new(
        abs_id: [u32; 3],
        group_size: [u32; 3],
        grid_size: [u32; 3],
        root: Arc<Function>,
        private_size: u32,
        memory: &mut GuestMemory,
    ) -> Result<Self> {
        let group_id = [
            abs_id[0] / group_size[0],
            abs_id[1] / group_size[1],
            abs_id[2] / group_size[2],
        ];
        let local_id = [
            abs_id[0] % group_size[0],
            abs_id[1] % group_size[1],
            abs_id[2] % group_size[2],
        ];
        let flat_local_id = local_id[0]
            + local_id[1] * group_size[0]
            + local_id[2] * group_size[0] * group_size[1];
        let abs_flat_id = abs_id[0] as u64
            + abs_id[1] as u64 * grid_size[0] as u64
            + abs_id[2] as u64 * grid_size[0] as u64 * grid_size[1] as u64;

        let private_segment = SegmentManager::new(memory, private_size)?;
        let kernel_frame = StackFrame::new(root, memory)?;
        Ok(Self {
            abs_id,
            local_id,
            group_id,
            flat_local_id,
            abs_flat_id,
            status: WorkItemStatus::Active,
            stack: vec![kernel_frame],
            private_segment,
        })
    }

    /// Absolute work-item id along `axis` (0, 1 or 2).
    pub fn abs_id(&self, axis: usize) -> u32 {
        self.abs_id[axis]
    }

    /// Group-local id along `axis`.
    pub fn local_id(&self, axis: usize) -> u32 {
        self.local_id[axis]
    }

    /// Owning work-group id along `axis`.
    pub fn group_id(&self, axis: usize) -> u32 {
        self.group_id[axis]
    }

    /// X-fastest flat id within the work-group.
    pub fn flat_local_id(&self) -> u32 {
        self.flat_local_id
    }

    /// X-fastest flat id within the whole grid.
    pub fn abs_flat_id(&self) -> u64 {
        self.abs_flat_id
    }

    /// Current scheduling status.
    pub fn status(&self) -> WorkItemStatus {
        self.status
    }

    /// Make the item eligible to step again after a barrier release.
    pub fn activate(&mut self) {
        self.status = WorkItemStatus::Active;
    }

    /// The innermost stack frame.
    pub fn current_frame(&self) -> Result<&StackFrame> {
        self.stack
            .last()
            .ok_or(EmuError::ProtocolViolation("empty call stack"))
    }

    /// The innermost stack frame, mutably.
    pub fn current_frame_mut(&mut self) -> Result<&mut StackFrame> {
        self.stack
            .last_mut()
            .ok_or(EmuError::ProtocolViolation("empty call stack"))
    }

    /// Read a condition register of the innermost frame.
    pub fn control_register(&self, name: &str) -> Result<bool> {
        self.current_frame()?.control_register(name)
    }

    /// Place the innermost frame's cursor at the code entry with the
    /// given section byte offset.
    pub fn jump_to_offset(&mut self, offset: u32) -> Result<()> {
        let frame = self.current_frame_mut()?;
        let index = frame
            .function
            .entry_at_offset(offset)
            .ok_or(EmuError::ProtocolViolation(
                "branch target is not a code-entry offset",
            ))?;
        frame.pc = Some(index);
        Ok(())
    }

    /// Execute one code entry.
    ///
    /// A suspended item does not step; it reports [`StepResult::Active`]
    /// and waits for the barrier release to reactivate it.
    pub fn execute(&mut self, env: &mut ExecEnv<'_>, handlers: &HandlerTable) -> Result<StepResult> {
        if self.status == WorkItemStatus::Suspended {
            return Ok(StepResult::Active);
        }
        let Some(frame) = self.stack.last() else {
            return Ok(StepResult::Finished);
        };
        let function = Arc::clone(&frame.function);
        let pc = frame.pc;

        match pc.and_then(|index| function.entry(index)) {
            None => {
                // Cursor ran past the body: implicit return.
                self.return_function(env)?;
            }
            Some(entry) => match &entry.kind {
                EntryKind::Instruction(inst) => {
                    env.ctx.count_instruction();
                    if env.ctx.config.execution.trace_lane_zero && self.flat_local_id == 0 {
                        tracing::trace!(
                            function = function.name(),
                            group = ?self.group_id,
                            inst = %inst,
                            "retire"
                        );
                    }
                    let handler = handlers
                        .get(inst.opcode)
                        .ok_or(EmuError::UnimplementedOpcode(inst.opcode))?;
                    match handler(self, inst, env)? {
                        InstOutcome::Advance => {
                            self.move_pc_forward(env)?;
                        }
                        InstOutcome::Jump => {}
                        InstOutcome::Barrier => {
                            // The arrival is part of executing the barrier:
                            // report it even if the pc advance unwinds the
                            // frame, or siblings parked earlier never see
                            // this lane arrive. An unwound item finishes on
                            // its first step after the release.
                            self.move_pc_forward(env)?;
                            self.status = WorkItemStatus::Suspended;
                            return Ok(StepResult::Barrier);
                        }
                    }
                }
                _ => self.execute_directive(env)?,
            },
        }

        if self.stack.is_empty() {
            Ok(StepResult::Finished)
        } else {
            Ok(StepResult::Active)
        }
    }

    /// Advance the innermost cursor by one entry, unwinding with an
    /// implicit return if it runs past the end of the body. Returns
    /// whether a frame is still executing afterwards.
    pub fn move_pc_forward(&mut self, env: &mut ExecEnv<'_>) -> Result<bool> {
        let frame = self.current_frame_mut()?;
        let next = frame.pc.map(|pc| pc + 1);
        match (next, frame.function.last_entry()) {
            (Some(index), Some(last)) if index <= last => {
                frame.pc = Some(index);
                Ok(true)
            }
            _ => {
                frame.pc = None;
                self.return_function(env)
            }
        }
    }

    /// Push a frame for `operands.callee` and copy the input actuals in.
    ///
    /// The caller's cursor stays on the call instruction; it is advanced
    /// when the callee returns, after outputs are copied back.
    pub fn call(&mut self, operands: &CallOperands, env: &mut ExecEnv<'_>) -> Result<()> {
        let callee = env.grid.executable.function(&operands.callee)?;
        let callee_frame = StackFrame::new(Arc::clone(&callee), &mut env.ctx.memory)?;
        {
            let caller = self
                .stack
                .last()
                .ok_or(EmuError::ProtocolViolation("call with empty call stack"))?;
            let lookup = |name: &str| caller.resolve_argument(name);
            pass_by_value(
                &lookup,
                &callee_frame.function_arguments,
                &callee,
                operands,
                &mut env.ctx.memory,
            )?;
        }
        tracing::debug!(callee = callee.name(), depth = self.stack.len(), "call");
        self.stack.push(callee_frame);
        Ok(())
    }

    /// Pop the innermost frame: copy outputs back to the caller, fire the
    /// return hook, free frame-owned storage, and advance the caller past
    /// its call instruction. Returns whether a frame is still executing.
    pub fn return_function(&mut self, env: &mut ExecEnv<'_>) -> Result<bool> {
        let mut callee_frame = self
            .stack
            .pop()
            .ok_or(EmuError::ProtocolViolation("return with empty call stack"))?;
        self.free_frame_variables(&mut callee_frame, env)?;

        // A frame with a native return hook stops here: the hook owns the
        // continuation, so no outputs are passed back and the caller's
        // cursor is left untouched.
        if let Some(callback) = callee_frame.return_callback.take() {
            callback(&mut env.ctx.memory)?;
            callee_frame.release(&mut env.ctx.memory)?;
            return Ok(false);
        }

        let continues = if let Some(caller) = self.stack.last() {
            let index = caller.pc.ok_or(EmuError::ProtocolViolation(
                "caller cursor lost across a call",
            ))?;
            let operands = match caller.function.entry(index).map(|e| &e.kind) {
                Some(EntryKind::Instruction(inst)) if inst.opcode == Opcode::Call => {
                    CallOperands::from_inst(inst)?
                }
                _ => {
                    return Err(EmuError::ProtocolViolation(
                        "caller cursor is not at a call instruction",
                    ))
                }
            };
            let lookup = |name: &str| caller.resolve_argument(name);
            pass_back_by_value(
                &lookup,
                &callee_frame.function_arguments,
                callee_frame.function(),
                &operands,
                &mut env.ctx.memory,
            )?;
            true
        } else {
            false
        };

        callee_frame.release(&mut env.ctx.memory)?;
        if continues {
            self.move_pc_forward(env)
        } else {
            Ok(false)
        }
    }

    fn free_frame_variables(
        &mut self,
        frame: &mut StackFrame,
        env: &mut ExecEnv<'_>,
    ) -> Result<()> {
        let variables: Vec<Variable> = frame.variable_scope.drain().collect();
        for var in variables {
            if var.is_formal() {
                continue;
            }
            match var.segment() {
                Segment::Global => env.ctx.memory.free(var.address())?,
                Segment::Group => {
                    let offset = var.address() - env.group_segment.base_address();
                    env.group_segment.free(offset)?;
                }
                Segment::Private => {
                    let offset = var.address() - self.private_segment.base_address();
                    self.private_segment.free(offset)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn execute_directive(&mut self, env: &mut ExecEnv<'_>) -> Result<()> {
        let Self {
            stack,
            private_segment,
            ..
        } = self;
        let frame = stack
            .last_mut()
            .ok_or(EmuError::ProtocolViolation("directive with empty call stack"))?;
        let function = Arc::clone(&frame.function);
        let index = frame.pc.ok_or(EmuError::ProtocolViolation(
            "directive cursor past end of body",
        ))?;
        let entry = function
            .entry(index)
            .ok_or(EmuError::ProtocolViolation("directive cursor out of range"))?;

        match &entry.kind {
            EntryKind::ArgBlockStart => {
                let size = arg_block_size(&function, index)?;
                frame.start_argument_scope(size, &mut env.ctx.memory)?;
            }
            EntryKind::ArgBlockEnd => {
                frame.close_argument_scope(&mut env.ctx.memory)?;
            }
            EntryKind::Variable(decl) => {
                let size = decl.byte_size()?;
                // Capped at the flat allocator's block alignment so the
                // prescanned arg-block arena size stays sufficient.
                let align = decl.ty.size().min(8);
                match decl.segment {
                    Segment::Global => {
                        let address = env.ctx.memory.allocate(size)?;
                        frame.variable_scope.declare(Variable::new(
                            &decl.name,
                            decl.ty,
                            decl.dim,
                            address,
                            Segment::Global,
                            false,
                        )?);
                    }
                    Segment::Group => {
                        let offset = env.group_segment.allocate(size, align)?;
                        frame.variable_scope.declare(Variable::new(
                            &decl.name,
                            decl.ty,
                            decl.dim,
                            env.group_segment.flat_address(offset),
                            Segment::Group,
                            false,
                        )?);
                    }
                    Segment::Private => {
                        let offset = private_segment.allocate(size, align)?;
                        frame.variable_scope.declare(Variable::new(
                            &decl.name,
                            decl.ty,
                            decl.dim,
                            private_segment.flat_address(offset),
                            Segment::Private,
                            false,
                        )?);
                    }
                    Segment::Arg => match &mut frame.argument_scope {
                        ArgumentScope::Open { scope, segment } => {
                            let offset = segment.allocate(size, align)?;
                            scope.declare(Variable::new(
                                &decl.name,
                                decl.ty,
                                decl.dim,
                                segment.flat_address(offset),
                                Segment::Arg,
                                false,
                            )?);
                        }
                        ArgumentScope::Closed => {
                            return Err(EmuError::ProtocolViolation(
                                "argument variable declared outside an argument block",
                            ))
                        }
                    },
                    other => {
                        return Err(EmuError::UnsupportedSegment {
                            segment: other,
                            operation: "variable declaration",
                        })
                    }
                }
            }
            EntryKind::Instruction(_) => {
                return Err(EmuError::ProtocolViolation(
                    "instruction entry dispatched as a directive",
                ))
            }
        }

        self.move_pc_forward(env)?;
        Ok(())
    }

    /// Resolve a named variable in `segment` to its flat address and size.
    pub fn variable_buffer(
        &self,
        env: &ExecEnv<'_>,
        segment: Segment,
        name: &str,
    ) -> Result<(u32, u32)> {
        let frame = self.current_frame()?;
        let var = match segment {
            Segment::Kernarg => env.grid.kernarg_scope.require(name, "kernel argument")?,
            Segment::Arg => {
                let from_block = match &frame.argument_scope {
                    ArgumentScope::Open { scope, .. } => scope.get(name),
                    ArgumentScope::Closed => None,
                };
                match from_block {
                    Some(var) => var,
                    None => frame.function_arguments.require(name, "argument")?,
                }
            }
            Segment::Global | Segment::Group | Segment::Private => {
                frame.variable_scope.require(name, "function")?
            }
            other => {
                return Err(EmuError::UnsupportedSegment {
                    segment: other,
                    operation: "variable lookup",
                })
            }
        };
        Ok((var.address(), var.size()))
    }

    /// Translate a segment-local address to a flat address.
    pub fn flat_address(&self, env: &ExecEnv<'_>, segment: Segment, address: u32) -> Result<u32> {
        match segment {
            Segment::Flat | Segment::Global => Ok(address),
            Segment::Group => Ok(env.group_segment.flat_address(address)),
            Segment::Private => Ok(self.private_segment.flat_address(address)),
            Segment::Kernarg => Ok(env.grid.kernarg_segment.flat_address(address)),
            other => Err(EmuError::UnsupportedSegment {
                segment: other,
                operation: "address translation",
            }),
        }
    }

    /// Render the call stack, innermost frame first, with the current
    /// value of every formal argument.
    pub fn backtrace(&self, memory: &GuestMemory) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for (depth, frame) in self.stack.iter().rev().enumerate() {
            let _ = write!(out, "#{depth} {} (", frame.function().name());
            for (i, arg) in frame.function().arguments().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}=", arg.name());
                let value = frame.function_arguments.get(arg.name()).and_then(|var| {
                    let mut buf = [0u8; 8];
                    let width = (var.size() as usize).min(8);
                    memory
                        .read(var.address(), &mut buf[..width])
                        .ok()
                        .map(|_| u64::from_le_bytes(buf))
                });
                match value {
                    Some(v) => {
                        let _ = write!(out, "{v:#x}");
                    }
                    None => out.push('?'),
                }
            }
            out.push_str(")\n");
        }
        out
    }

    /// Tear down the item: drop remaining frames and return the private
    /// arena to flat memory.
    pub fn release(&mut self, memory: &mut GuestMemory) -> Result<()> {
        while let Some(mut frame) = self.stack.pop() {
            frame.release(memory)?;
        }
        self.private_segment.release(memory)
    }
}

/// Size of the arena an argument block needs: the declared ARG variables
/// after `start`, laid out in order with natural alignment after the
/// reserved-null prefix. Zero when the block declares nothing.
fn arg_block_size(function: &Function, start: usize) -> Result<u32> {
    let mut cursor = NULL_RESERVE;
    let mut any = false;
    let mut index = start + 1;
    while let Some(entry) = function.entry(index) {
        match &entry.kind {
            EntryKind::ArgBlockEnd => break,
            EntryKind::Variable(decl) if decl.segment == Segment::Arg => {
                any = true;
                cursor = align_up(cursor, decl.ty.size());
                cursor += decl.byte_size()?;
            }
            _ => {}
        }
        index += 1;
    }
    Ok(if any { cursor } else { 0 })
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("abs_id", &self.abs_id)
            .field("status", &self.status)
            .field("depth", &self.stack.len())
            .finish()
    }
}
