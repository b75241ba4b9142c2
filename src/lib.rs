//! # simt-core
//!
//! Functional kernel-execution core for a heterogeneous-computing device
//! simulator. The crate models the dispatch hierarchy of an HSA-style
//! accelerator: a [`Grid`] per kernel launch, partitioned into
//! [`WorkGroup`]s that own group-shared memory and barrier state, stepped
//! as [`Wavefront`] bundles of [`WorkItem`] lanes, each with its own call
//! stack and private memory.
//!
//! ## Architecture
//!
//! ```text
//! Emulator ── EmuContext (flat memory, config, counters)
//!    │
//!    └─ Grid ── kernarg segment/scope, completion signal
//!         └─ WorkGroup ── group segment, barrier held-set
//!              └─ Wavefront ── lockstep step loop
//!                   └─ WorkItem ── call stack, private segment
//!                        └─ StackFrame ── registers, variable scopes
//! ```
//!
//! Instruction semantics are pluggable: the core ships the control-flow
//! and protocol opcodes (`call`, `ret`, `barrier`, branches) in its
//! [`HandlerTable`] and the embedding simulator registers the compute
//! opcodes it cares about. Loading (binary parsing, disassembly) is out
//! of scope; code arrives as decoded [`code::CodeEntry`] vectors built
//! through [`function::FunctionBuilder`].
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use simt_core::{
//!     code::{EntryKind, Inst, Opcode, TypeKind},
//!     function::{Executable, FunctionBuilder},
//!     packet::{DispatchPacket, Signal},
//!     EmuConfig, Emulator,
//! };
//!
//! # fn main() -> simt_core::Result<()> {
//! let mut executable = Executable::new();
//! let kernel = executable.add_function(
//!     FunctionBuilder::new("&noop")
//!         .entry(EntryKind::Instruction(Inst::nullary(Opcode::Ret, TypeKind::B1)))
//!         .build(),
//! );
//!
//! let mut emulator = Emulator::new(EmuConfig::default())?;
//! let packet = DispatchPacket {
//!     dimensions: 1,
//!     grid_size: [64, 1, 1],
//!     workgroup_size: [16, 1, 1],
//!     kernel_object: kernel,
//!     kernarg_address: 0,
//!     private_segment_size: 1024,
//!     group_segment_size: 4096,
//!     completion_signal: Signal::new(1),
//! };
//! let mut grid = emulator.launch(Arc::new(executable), &packet)?;
//! emulator.run(&mut grid)?;
//! assert_eq!(packet.completion_signal.value(), 0);
//! # Ok(())
//! # }
//! ```

pub mod code;
pub mod config;
pub mod emulator;
pub mod error;
pub mod frame;
pub mod function;
pub mod grid;
pub mod isa;
pub mod memory;
pub mod packet;
pub mod segment;
pub mod variable;
pub mod wavefront;
pub mod work_group;
pub mod work_item;

pub use config::EmuConfig;
pub use emulator::{EmuContext, Emulator};
pub use error::{EmuError, Result};
pub use grid::{Grid, GridState};
pub use isa::{ExecEnv, HandlerTable, InstOutcome};
pub use memory::GuestMemory;
pub use segment::SegmentManager;
pub use wavefront::Wavefront;
pub use work_group::WorkGroup;
pub use work_item::{StepResult, WorkItem, WorkItemStatus};

/// Crate version, for embedding simulators that report it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
