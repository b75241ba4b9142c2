//! # Emulator Driver
//!
//! The top of the crate: shared emulator state ([`EmuContext`]) and the
//! driving loop ([`Emulator`]) that launches dispatch packets as grids and
//! ticks them to completion. There is exactly one context per emulator;
//! every component that needs flat memory or configuration receives it
//! explicitly instead of reaching for process-wide state.

use std::sync::Arc;

use crate::config::EmuConfig;
use crate::error::Result;
use crate::function::Executable;
use crate::grid::Grid;
use crate::isa::HandlerTable;
use crate::memory::GuestMemory;
use crate::packet::DispatchPacket;

/// Shared emulator state: flat memory, configuration, counters.
pub struct EmuContext {
    /// The flat guest memory.
    pub memory: GuestMemory,
    /// The validated configuration.
    pub config: EmuConfig,
    num_instructions: u64,
}

impl EmuContext {
    /// Create a context from a configuration.
    pub fn new(config: EmuConfig) -> Result<Self> {
        config.validate()?;
        let memory = GuestMemory::new(config.memory.flat_memory_limit);
        Ok(Self {
            memory,
            config,
            num_instructions: 0,
        })
    }

    /// Record one retired instruction.
    pub fn count_instruction(&mut self) {
        self.num_instructions += 1;
    }

    /// Total instructions retired across every grid.
    pub fn instructions_retired(&self) -> u64 {
        self.num_instructions
    }
}

impl std::fmt::Debug for EmuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmuContext")
            .field("memory", &self.memory)
            .field("instructions", &self.num_instructions)
            .finish()
    }
}

/// The driving loop: owns the context and the handler table.
#[derive(Debug)]
pub struct Emulator {
    context: EmuContext,
    handlers: HandlerTable,
}

impl Emulator {
    /// Create an emulator with the core opcode handlers installed.
    pub fn new(config: EmuConfig) -> Result<Self> {
        Ok(Self {
            context: EmuContext::new(config)?,
            handlers: HandlerTable::with_core_ops(),
        })
    }

    /// The shared context.
    pub fn context(&self) -> &EmuContext {
        &self.context
    }

    /// The shared context, mutably (host-side memory staging).
    pub fn context_mut(&mut self) -> &mut EmuContext {
        &mut self.context
    }

    /// The handler table, for registering compute opcodes.
    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    /// Turn a dispatch packet into a runnable grid.
    pub fn launch(
        &mut self,
        executable: Arc<Executable>,
        packet: &DispatchPacket,
    ) -> Result<Grid> {
        let wavefront_size = self.context.config.execution.wavefront_size;
        Grid::new(&mut self.context, executable, packet, wavefront_size)
    }

    /// Step every live work-group of `grid` once. Returns whether the
    /// grid still has work.
    pub fn tick(&mut self, grid: &mut Grid) -> Result<bool> {
        let Self { context, handlers } = self;
        grid.execute(context, handlers)
    }

    /// Tick `grid` until it drains.
    pub fn run(&mut self, grid: &mut Grid) -> Result<()> {
        while self.tick(grid)? {}
        Ok(())
    }
}
