//! # Segment Manager
//!
//! Arena allocator carving one named memory segment out of the flat guest
//! memory. Every scoped allocation in the core (kernel arguments, group
//! memory, private memory, call-argument blocks, function-argument blocks)
//! goes through one of these.
//!
//! ## Design
//!
//! Free space is tracked twice: a size-ordered multimap for allocation
//! lookup (first fit among equal-or-larger holes) and an address-ordered
//! map for O(log n) coalescing on free. Live allocations are tracked by
//! flat address. Holes and chunks partition the arena; offset zero is
//! reserved at creation so the allocator can never return it, letting a
//! zero offset serve as a null sentinel.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EmuError, Result};
use crate::memory::GuestMemory;

/// Bytes reserved at the start of every backed arena, never allocatable.
pub const NULL_RESERVE: u32 = 4;

fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Arena allocator over a contiguous slice of flat guest memory.
///
/// A zero-size manager is "unbacked": it owns no flat memory, every
/// allocation fails with [`EmuError::OutOfSpace`], and release is a no-op.
pub struct SegmentManager {
    /// Flat address of the start of the arena. Stable for the manager's
    /// lifetime.
    base_address: u32,
    /// Arena size in bytes; zero for an unbacked manager.
    size: u32,
    /// Free holes: size -> flat addresses of holes with that size.
    holes_by_size: BTreeMap<u32, BTreeSet<u32>>,
    /// Free holes: flat address -> size, for adjacency merging.
    holes_by_addr: BTreeMap<u32, u32>,
    /// Live allocations: flat address -> size.
    chunks: BTreeMap<u32, u32>,
    /// Whether the arena has been returned to the parent allocator.
    released: bool,
}

impl SegmentManager {
    /// Carve a `size`-byte arena out of `memory`.
    ///
    /// The first [`NULL_RESERVE`] bytes of the arena are reserved so that
    /// offset zero is never a valid allocation.
    pub fn new(memory: &mut GuestMemory, size: u32) -> Result<Self> {
        if size == 0 {
            return Ok(Self {
                base_address: 0,
                size: 0,
                holes_by_size: BTreeMap::new(),
                holes_by_addr: BTreeMap::new(),
                chunks: BTreeMap::new(),
                released: true,
            });
        }

        let base_address = memory.allocate(size)?;
        let mut manager = Self {
            base_address,
            size,
            holes_by_size: BTreeMap::new(),
            holes_by_addr: BTreeMap::new(),
            chunks: BTreeMap::new(),
            released: false,
        };
        if size > NULL_RESERVE {
            manager.insert_hole(base_address + NULL_RESERVE, size - NULL_RESERVE);
        }
        Ok(manager)
    }

    /// Flat address of the start of the arena.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Arena size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Translate a segment-local offset to a flat address.
    pub fn flat_address(&self, offset: u32) -> u32 {
        offset + self.base_address
    }

    /// Bytes currently handed out.
    pub fn used_bytes(&self) -> u32 {
        self.chunks.values().sum()
    }

    /// Allocate `size` bytes with the given alignment.
    ///
    /// Holes are searched in size order, first fit among equal-or-larger
    /// holes; the chosen hole is carved at the first aligned address
    /// within it and any leading/trailing remainder stays free. The
    /// returned segment-local offset is never zero.
    pub fn allocate(&mut self, size: u32, alignment: u32) -> Result<u32> {
        let alignment = alignment.max(1);
        if size == 0 || !alignment.is_power_of_two() {
            return Err(EmuError::OutOfSpace { size, alignment });
        }

        // Size-ordered walk over every hole that could possibly fit.
        let mut found = None;
        'search: for (&hole_size, addrs) in self.holes_by_size.range(size..) {
            for &hole_addr in addrs {
                let carved = align_up(hole_addr, alignment);
                if carved + size <= hole_addr + hole_size {
                    found = Some((hole_addr, hole_size, carved));
                    break 'search;
                }
            }
        }
        let (hole_addr, hole_size, carved) =
            found.ok_or(EmuError::OutOfSpace { size, alignment })?;

        self.remove_hole(hole_addr, hole_size);
        if carved > hole_addr {
            self.insert_hole(hole_addr, carved - hole_addr);
        }
        let hole_end = hole_addr + hole_size;
        if carved + size < hole_end {
            self.insert_hole(carved + size, hole_end - (carved + size));
        }
        self.chunks.insert(carved, size);

        tracing::trace!(
            base = self.base_address,
            offset = carved - self.base_address,
            size,
            "segment allocate"
        );
        Ok(carved - self.base_address)
    }

    /// Free the chunk at the given segment-local offset.
    ///
    /// The freed block becomes a hole and is merged with any
    /// address-contiguous holes to bound long-run fragmentation.
    pub fn free(&mut self, offset: u32) -> Result<()> {
        let flat = offset + self.base_address;
        let size = self
            .chunks
            .remove(&flat)
            .ok_or(EmuError::InvalidFree { address: offset })?;

        let mut addr = flat;
        let mut len = size;

        if let Some((&prev_addr, &prev_size)) = self.holes_by_addr.range(..flat).next_back() {
            if prev_addr + prev_size == addr {
                self.remove_hole(prev_addr, prev_size);
                addr = prev_addr;
                len += prev_size;
            }
        }
        if let Some(&next_size) = self.holes_by_addr.get(&(flat + size)) {
            self.remove_hole(flat + size, next_size);
            len += next_size;
        }

        self.insert_hole(addr, len);
        tracing::trace!(base = self.base_address, offset, size, "segment free");
        Ok(())
    }

    /// Return the whole arena to the parent allocator.
    ///
    /// A no-op for unbacked (zero-size) managers and for managers already
    /// released. Any chunks still live simply vanish with the arena.
    pub fn release(&mut self, memory: &mut GuestMemory) -> Result<()> {
        if self.released {
            return Ok(());
        }
        memory.free(self.base_address)?;
        self.released = true;
        self.holes_by_size.clear();
        self.holes_by_addr.clear();
        self.chunks.clear();
        Ok(())
    }

    fn insert_hole(&mut self, addr: u32, size: u32) {
        self.holes_by_size.entry(size).or_default().insert(addr);
        self.holes_by_addr.insert(addr, size);
    }

    fn remove_hole(&mut self, addr: u32, size: u32) {
        if let Some(addrs) = self.holes_by_size.get_mut(&size) {
            addrs.remove(&addr);
            if addrs.is_empty() {
                self.holes_by_size.remove(&size);
            }
        }
        self.holes_by_addr.remove(&addr);
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("base_address", &self.base_address)
            .field("size", &self.size)
            .field("chunks", &self.chunks.len())
            .field("holes", &self.holes_by_addr.len())
            .field("released", &self.released)
            .finish()
    }
}
