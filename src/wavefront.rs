//! # Wavefronts
//!
//! A wavefront is the scheduling bundle of work-items that step together
//! in lockstep: one call to [`Wavefront::execute`] steps every live item
//! in the bundle exactly once, in flat-local-id order. Emulation is
//! functional rather than cycle-accurate, so "lockstep" here means a
//! deterministic round-robin over the lanes, not simultaneous retirement.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::isa::{ExecEnv, HandlerTable};
use crate::work_item::{StepResult, WorkItem};

/// A bundle of work-items stepped together.
#[derive(Debug)]
pub struct Wavefront {
    id: u32,
    width: u32,
    /// Live items, keyed by flat local id. Finished items are removed.
    work_items: BTreeMap<u32, WorkItem>,
}

impl Wavefront {
    /// Create an empty wavefront with the given id and lane width.
    pub fn new(id: u32, width: u32) -> Self {
        Self {
            id,
            width,
            work_items: BTreeMap::new(),
        }
    }

    /// Wavefront id within its work-group.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Configured lane width.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Number of live work-items.
    pub fn len(&self) -> usize {
        self.work_items.len()
    }

    /// Whether every item has finished.
    pub fn is_empty(&self) -> bool {
        self.work_items.is_empty()
    }

    /// Add a work-item to the bundle.
    pub fn add_work_item(&mut self, item: WorkItem) {
        self.work_items.insert(item.flat_local_id(), item);
    }

    /// Borrow a live item by flat local id.
    pub fn work_item(&self, flat_local_id: u32) -> Option<&WorkItem> {
        self.work_items.get(&flat_local_id)
    }

    /// Iterate over the live items in flat-local-id order.
    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.work_items.values()
    }

    /// Step every live item once.
    ///
    /// Items that arrive at a barrier have their flat local id appended to
    /// `barrier_hits`; items that finish are torn down and removed.
    /// Returns whether any item is still live.
    pub fn execute(
        &mut self,
        env: &mut ExecEnv<'_>,
        handlers: &HandlerTable,
        barrier_hits: &mut Vec<u32>,
    ) -> Result<bool> {
        let ids: Vec<u32> = self.work_items.keys().copied().collect();
        for id in ids {
            let step = match self.work_items.get_mut(&id) {
                Some(item) => item.execute(env, handlers)?,
                None => continue,
            };
            match step {
                StepResult::Active => {}
                StepResult::Barrier => barrier_hits.push(id),
                StepResult::Finished => {
                    if let Some(mut done) = self.work_items.remove(&id) {
                        done.release(&mut env.ctx.memory)?;
                    }
                }
            }
        }
        Ok(!self.work_items.is_empty())
    }

    /// Reactivate every suspended item after a barrier release.
    pub fn activate_all(&mut self) {
        for item in self.work_items.values_mut() {
            item.activate();
        }
    }

    /// Tear down every remaining item.
    pub fn release(&mut self, memory: &mut crate::memory::GuestMemory) -> Result<()> {
        let ids: Vec<u32> = self.work_items.keys().copied().collect();
        for id in ids {
            if let Some(mut item) = self.work_items.remove(&id) {
                item.release(memory)?;
            }
        }
        Ok(())
    }
}
