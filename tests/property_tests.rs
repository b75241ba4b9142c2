//! Property-based tests for the allocators and the index-space math.

use proptest::prelude::*;
use std::sync::Arc;

use simt_core::function::FunctionBuilder;
use simt_core::work_item::WorkItem;
use simt_core::{EmuError, GuestMemory, SegmentManager};

proptest! {
    /// Live segment allocations never overlap and never sit at offset zero.
    #[test]
    fn segment_allocations_are_disjoint(
        requests in prop::collection::vec((1u32..64, 0u32..4), 1..24)
    ) {
        let mut memory = GuestMemory::new(1 << 20);
        let mut segment = SegmentManager::new(&mut memory, 1 << 14).unwrap();
        let mut live: Vec<(u32, u32)> = Vec::new();

        for (size, align_exp) in requests {
            let alignment = 1u32 << align_exp;
            let offset = segment.allocate(size, alignment).unwrap();
            prop_assert_ne!(offset, 0);
            prop_assert_eq!(segment.flat_address(offset) % alignment, 0);
            for &(other, other_size) in &live {
                let disjoint = offset + size <= other || other + other_size <= offset;
                prop_assert!(disjoint, "chunks [{offset}, +{size}) and [{other}, +{other_size}) overlap");
            }
            live.push((offset, size));
        }
    }

    /// Freeing in any order, every freed chunk becomes reusable and a
    /// never-allocated offset is always rejected.
    #[test]
    fn segment_free_is_checked(
        sizes in prop::collection::vec(1u32..64, 1..16),
        stray in 1u32..8192,
    ) {
        let mut memory = GuestMemory::new(1 << 20);
        let mut segment = SegmentManager::new(&mut memory, 1 << 14).unwrap();

        let offsets: Vec<u32> = sizes
            .iter()
            .map(|&s| segment.allocate(s, 1).unwrap())
            .collect();
        if !offsets.contains(&stray) {
            let rejected = matches!(segment.free(stray), Err(EmuError::InvalidFree { .. }));
            prop_assert!(rejected, "free of a never-allocated offset succeeded");
        }
        for offset in offsets {
            segment.free(offset).unwrap();
        }
        // Everything went back: a full-size-minus-reserve request fits.
        prop_assert!(segment.allocate((1 << 14) - 8, 1).is_ok());
    }

    /// Flat translation is linear in the offset.
    #[test]
    fn flat_address_is_linear(size in 64u32..4096, a in 0u32..1024, b in 0u32..1024) {
        let mut memory = GuestMemory::new(1 << 20);
        let segment = SegmentManager::new(&mut memory, size.max(2048)).unwrap();
        prop_assert_eq!(
            segment.flat_address(a) + b,
            segment.flat_address(a + b)
        );
    }

    /// Flat-memory blocks survive an arbitrary alloc/free interleaving
    /// without overlap.
    #[test]
    fn guest_memory_blocks_are_disjoint(
        ops in prop::collection::vec((1u32..256, any::<bool>()), 1..32)
    ) {
        let mut memory = GuestMemory::new(1 << 20);
        let mut live: Vec<(u32, u32)> = Vec::new();

        for (size, free_one) in ops {
            if free_one && !live.is_empty() {
                let (address, _) = live.swap_remove(live.len() / 2);
                memory.free(address).unwrap();
                continue;
            }
            let address = memory.allocate(size).unwrap();
            prop_assert!(address >= GuestMemory::BASE);
            for &(other, other_size) in &live {
                let disjoint = address + size <= other || other + other_size <= address;
                prop_assert!(disjoint);
            }
            live.push((address, size));
        }
    }

    /// Work-item id math is self-consistent: absolute position decomposes
    /// into group id and local id, and the flat local id is x-fastest.
    #[test]
    fn work_item_ids_decompose(
        grid in (1u32..32, 1u32..8, 1u32..4),
        group in (1u32..8, 1u32..4, 1u32..2),
        seed in any::<u64>(),
    ) {
        let grid_size = [grid.0, grid.1, grid.2];
        let group_size = [group.0, group.1, group.2];
        let total = (grid.0 as u64) * (grid.1 as u64) * (grid.2 as u64);
        let i = seed % total;
        let plane = grid_size[0] as u64 * grid_size[1] as u64;
        let abs_id = [
            (i % grid_size[0] as u64) as u32,
            ((i % plane) / grid_size[0] as u64) as u32,
            (i / plane) as u32,
        ];

        let mut memory = GuestMemory::new(1 << 20);
        let root = Arc::new(FunctionBuilder::new("&k").build());
        let item = WorkItem::new(abs_id, group_size, grid_size, root, 0, &mut memory).unwrap();

        for axis in 0..3 {
            prop_assert_eq!(
                item.group_id(axis) * group_size[axis] + item.local_id(axis),
                abs_id[axis]
            );
            prop_assert!(item.local_id(axis) < group_size[axis]);
        }
        prop_assert_eq!(
            item.flat_local_id(),
            item.local_id(0)
                + item.local_id(1) * group_size[0]
                + item.local_id(2) * group_size[0] * group_size[1]
        );
        prop_assert_eq!(item.abs_flat_id(), i);
    }
}
