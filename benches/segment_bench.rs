use criterion::{black_box, criterion_group, criterion_main, Criterion};

use simt_core::{GuestMemory, SegmentManager};

fn bench_segment_churn(c: &mut Criterion) {
    c.bench_function("segment_alloc_free_churn", |b| {
        let mut memory = GuestMemory::new(1 << 24);
        let mut segment = SegmentManager::new(&mut memory, 1 << 20).unwrap();
        b.iter(|| {
            let mut offsets = Vec::with_capacity(64);
            for i in 0..64u32 {
                let size = 8 + (i % 8) * 16;
                offsets.push(segment.allocate(black_box(size), 8).unwrap());
            }
            // Free in a mixed order to exercise coalescing.
            for chunk in offsets.chunks(2).rev() {
                for &offset in chunk {
                    segment.free(offset).unwrap();
                }
            }
        });
    });
}

fn bench_flat_allocator(c: &mut Criterion) {
    c.bench_function("guest_memory_alloc_free", |b| {
        let mut memory = GuestMemory::new(1 << 24);
        b.iter(|| {
            let mut addresses = Vec::with_capacity(128);
            for i in 0..128u32 {
                addresses.push(memory.allocate(black_box(16 + i % 64)).unwrap());
            }
            for address in addresses.into_iter().rev() {
                memory.free(address).unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_segment_churn, bench_flat_allocator);
criterion_main!(benches);
