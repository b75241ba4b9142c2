//! # Grids
//!
//! A grid is one kernel dispatch: the full index space of work-items, the
//! kernel-argument staging segment, and the completion signal owed to the
//! host. Construction resolves the dispatch packet against the executable
//! and deploys every work-item into its work-group up front; execution
//! then steps the groups round-robin until the grid drains.
//!
//! Deployment walks the index space x-fastest: the linear index `i` maps
//! to `(i % gx, (i / gx) % gy, i / (gx * gy))`, and flat group ids follow
//! the same rule over the group-count extents.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::code::Segment;
use crate::emulator::EmuContext;
use crate::error::Result;
use crate::function::{ArgDirection, Executable, Function};
use crate::isa::HandlerTable;
use crate::packet::{DispatchPacket, Signal};
use crate::segment::SegmentManager;
use crate::variable::{Variable, VariableScope};
use crate::work_group::WorkGroup;
use crate::work_item::WorkItem;

/// Lifecycle state of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridState {
    /// Work-groups still hold live work-items.
    Active,
    /// Every item finished; the completion signal has been decremented.
    Done,
}

/// Read-only view of a grid handed to instruction handlers.
pub struct GridEnv<'a> {
    /// Number of live dimensions, 1 to 3.
    pub dimensions: u32,
    /// Grid extent per axis.
    pub grid_size: [u32; 3],
    /// Work-group extent per axis.
    pub group_size: [u32; 3],
    /// Work-group count per axis.
    pub group_count: [u32; 3],
    /// Kernel-argument bindings.
    pub kernarg_scope: &'a VariableScope,
    /// Arena backing the kernel arguments.
    pub kernarg_segment: &'a SegmentManager,
    /// The executable the grid was dispatched from.
    pub executable: &'a Executable,
}

/// One kernel dispatch over a 3D index space.
pub struct Grid {
    state: GridState,
    dimensions: u32,
    grid_size: [u32; 3],
    group_size: [u32; 3],
    group_count: [u32; 3],
    root_function: Arc<Function>,
    executable: Arc<Executable>,
    kernarg_segment: SegmentManager,
    kernarg_scope: VariableScope,
    completion_signal: Signal,
    /// Live groups keyed by flat group id.
    work_groups: BTreeMap<u32, WorkGroup>,
}

impl Grid {
    /// Construct a grid from a dispatch packet: resolve the kernel, stage
    /// its arguments, and deploy every work-item.
    pub fn new(
        ctx: &mut EmuContext,
        executable: Arc<Executable>,
        packet: &DispatchPacket,
        wavefront_size: u32,
    ) -> Result<Self> {
        let root = executable.function_by_handle(packet.kernel_object)?;
        let grid_size = packet.grid_size.map(|n| n.max(1));
        let group_size = packet.workgroup_size.map(|n| n.max(1));
        let group_count = [
            grid_size[0].div_ceil(group_size[0]),
            grid_size[1].div_ceil(group_size[1]),
            grid_size[2].div_ceil(group_size[2]),
        ];

        // Stage kernel arguments: every formal gets storage in the
        // kernarg arena, input formals are copied from the host image.
        let mut kernarg_segment =
            SegmentManager::new(&mut ctx.memory, root.argument_segment_size())?;
        let mut kernarg_scope = VariableScope::new();
        for arg in root.arguments() {
            let offset = kernarg_segment.allocate(arg.size(), arg.ty().size().min(8))?;
            let flat = kernarg_segment.flat_address(offset);
            if arg.direction() == ArgDirection::Input && packet.kernarg_address != 0 {
                ctx.memory
                    .copy(flat, packet.kernarg_address + arg.offset(), arg.size())?;
            }
            kernarg_scope.declare(Variable::new(
                arg.name(),
                arg.ty(),
                arg.dim(),
                flat,
                Segment::Kernarg,
                true,
            )?);
        }

        let mut grid = Self {
            state: GridState::Active,
            dimensions: packet.dimensions.clamp(1, 3),
            grid_size,
            group_size,
            group_count,
            root_function: Arc::clone(&root),
            executable,
            kernarg_segment,
            kernarg_scope,
            completion_signal: packet.completion_signal.clone(),
            work_groups: BTreeMap::new(),
        };

        // Deploy the index space, x-fastest.
        let plane = grid_size[0] as u64 * grid_size[1] as u64;
        let total = plane * grid_size[2] as u64;
        for i in 0..total {
            let x = (i % grid_size[0] as u64) as u32;
            let y = ((i % plane) / grid_size[0] as u64) as u32;
            let z = (i / plane) as u32;
            let item = WorkItem::new(
                [x, y, z],
                group_size,
                grid_size,
                Arc::clone(&root),
                packet.private_segment_size,
                &mut ctx.memory,
            )?;
            let flat_group = item.group_id(0)
                + item.group_id(1) * group_count[0]
                + item.group_id(2) * group_count[0] * group_count[1];
            if !grid.work_groups.contains_key(&flat_group) {
                let group = WorkGroup::new(
                    [item.group_id(0), item.group_id(1), item.group_id(2)],
                    flat_group,
                    &mut ctx.memory,
                    packet.group_segment_size,
                )?;
                grid.work_groups.insert(flat_group, group);
            }
            if let Some(group) = grid.work_groups.get_mut(&flat_group) {
                group.add_work_item(item, wavefront_size);
            }
        }

        tracing::info!(
            kernel = root.name(),
            ?grid_size,
            ?group_size,
            groups = grid.work_groups.len(),
            "grid constructed"
        );
        Ok(grid)
    }

    /// Lifecycle state.
    pub fn state(&self) -> GridState {
        self.state
    }

    /// Number of live work-groups.
    pub fn num_work_groups(&self) -> usize {
        self.work_groups.len()
    }

    /// Borrow a live work-group by flat id.
    pub fn work_group(&self, flat_id: u32) -> Option<&WorkGroup> {
        self.work_groups.get(&flat_id)
    }

    /// Iterate over the live work-groups in flat-id order.
    pub fn work_groups(&self) -> impl Iterator<Item = &WorkGroup> {
        self.work_groups.values()
    }

    /// The kernel this grid runs.
    pub fn root_function(&self) -> &Arc<Function> {
        &self.root_function
    }

    /// Step every live work-group once.
    ///
    /// Returns whether the grid still has live items. On the tick that
    /// drains the last group, the kernarg arena is returned and the
    /// completion signal is decremented exactly once.
    pub fn execute(&mut self, ctx: &mut EmuContext, handlers: &HandlerTable) -> Result<bool> {
        if self.state == GridState::Done {
            return Ok(false);
        }

        let mut drained = Vec::new();
        {
            let Self {
                work_groups,
                kernarg_scope,
                kernarg_segment,
                executable,
                dimensions,
                grid_size,
                group_size,
                group_count,
                ..
            } = self;
            let env = GridEnv {
                dimensions: *dimensions,
                grid_size: *grid_size,
                group_size: *group_size,
                group_count: *group_count,
                kernarg_scope,
                kernarg_segment,
                executable: executable.as_ref(),
            };
            for (&id, group) in work_groups.iter_mut() {
                if !group.execute(ctx, handlers, &env)? {
                    drained.push(id);
                }
            }
        }

        for id in drained {
            if let Some(mut group) = self.work_groups.remove(&id) {
                group.release(&mut ctx.memory)?;
            }
        }

        if self.work_groups.is_empty() {
            self.kernarg_segment.release(&mut ctx.memory)?;
            self.completion_signal.decrement();
            self.state = GridState::Done;
            tracing::info!(kernel = self.root_function.name(), "grid complete");
            return Ok(false);
        }
        Ok(true)
    }
}

impl std::fmt::Debug for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("kernel", &self.root_function.name())
            .field("state", &self.state)
            .field("grid_size", &self.grid_size)
            .field("group_size", &self.group_size)
            .field("live_groups", &self.work_groups.len())
            .finish()
    }
}
