//! # Work-Groups
//!
//! A work-group owns the group-shared memory arena and the barrier state
//! for its work-items, which it partitions into wavefronts by flat local
//! id.
//!
//! ## Barrier protocol
//!
//! A barrier releases all-or-nothing: items that execute a barrier
//! instruction suspend and are recorded in a held set, and only when the
//! held set covers every work-item in the group does the group reactivate
//! them all at once. Recording the same item twice before the release is
//! idempotent, so a barrier can never release early from duplicate hits.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::grid::GridEnv;
use crate::isa::{ExecEnv, HandlerTable};
use crate::memory::GuestMemory;
use crate::segment::SegmentManager;
use crate::wavefront::Wavefront;
use crate::work_item::WorkItem;

/// A work-group: wavefronts, group memory, barrier state.
#[derive(Debug)]
pub struct WorkGroup {
    group_id: [u32; 3],
    flat_id: u32,
    group_segment: SegmentManager,
    /// Wavefronts keyed by id (`flat_local_id / wavefront_size`).
    wavefronts: BTreeMap<u32, Wavefront>,
    /// Flat local ids currently suspended at the group barrier.
    held_items: BTreeSet<u32>,
    /// Total items deployed into this group, the barrier release count.
    num_work_items: u32,
}

impl WorkGroup {
    /// Create an empty group with a `group_segment_size`-byte shared arena.
    pub fn new(
        group_id: [u32; 3],
        flat_id: u32,
        memory: &mut GuestMemory,
        group_segment_size: u32,
    ) -> Result<Self> {
        Ok(Self {
            group_id,
            flat_id,
            group_segment: SegmentManager::new(memory, group_segment_size)?,
            wavefronts: BTreeMap::new(),
            held_items: BTreeSet::new(),
            num_work_items: 0,
        })
    }

    /// Group id along `axis`.
    pub fn group_id(&self, axis: usize) -> u32 {
        self.group_id[axis]
    }

    /// X-fastest flat group id within the grid.
    pub fn flat_id(&self) -> u32 {
        self.flat_id
    }

    /// Total items deployed into this group.
    pub fn num_work_items(&self) -> u32 {
        self.num_work_items
    }

    /// Number of items currently held at the barrier.
    pub fn num_held_items(&self) -> u32 {
        self.held_items.len() as u32
    }

    /// The group-shared memory arena.
    pub fn group_segment(&self) -> &SegmentManager {
        &self.group_segment
    }

    /// Iterate over the live wavefronts in id order. With
    /// [`Wavefront::work_items`] this lets a driving loop walk down to a
    /// failing work-item and render its backtrace.
    pub fn wavefronts(&self) -> impl Iterator<Item = &Wavefront> {
        self.wavefronts.values()
    }

    /// Deploy a work-item, creating its wavefront on first use.
    pub fn add_work_item(&mut self, item: WorkItem, wavefront_size: u32) {
        let wavefront_id = item.flat_local_id() / wavefront_size;
        self.wavefronts
            .entry(wavefront_id)
            .or_insert_with(|| Wavefront::new(wavefront_id, wavefront_size))
            .add_work_item(item);
        self.num_work_items += 1;
    }

    /// Record that `flat_local_id` arrived at the barrier; release every
    /// held item if the whole group has now arrived. Duplicate arrivals
    /// of an already-held id are ignored. Returns whether a release
    /// happened.
    pub fn hit_barrier(&mut self, flat_local_id: u32) -> bool {
        self.held_items.insert(flat_local_id);
        if self.num_work_items > 0 && self.held_items.len() as u32 == self.num_work_items {
            for wavefront in self.wavefronts.values_mut() {
                wavefront.activate_all();
            }
            self.held_items.clear();
            tracing::debug!(group = self.flat_id, "barrier release");
            true
        } else {
            false
        }
    }

    /// Step every wavefront once, then process barrier arrivals.
    ///
    /// Returns whether the group still has live work-items.
    pub fn execute(
        &mut self,
        ctx: &mut crate::emulator::EmuContext,
        handlers: &HandlerTable,
        grid: &GridEnv<'_>,
    ) -> Result<bool> {
        let mut hits = Vec::new();
        let mut drained = Vec::new();
        {
            let Self {
                group_segment,
                wavefronts,
                ..
            } = self;
            for (&id, wavefront) in wavefronts.iter_mut() {
                let mut env = ExecEnv {
                    ctx: &mut *ctx,
                    group_segment: &mut *group_segment,
                    grid,
                };
                if !wavefront.execute(&mut env, handlers, &mut hits)? {
                    drained.push(id);
                }
            }
        }
        for id in drained {
            self.wavefronts.remove(&id);
        }
        for id in hits {
            self.hit_barrier(id);
        }
        Ok(!self.wavefronts.is_empty())
    }

    /// Tear down remaining items and return the group arena.
    pub fn release(&mut self, memory: &mut GuestMemory) -> Result<()> {
        for wavefront in self.wavefronts.values_mut() {
            wavefront.release(memory)?;
        }
        self.wavefronts.clear();
        self.held_items.clear();
        self.group_segment.release(memory)
    }
}
