//! Property tests for the region allocators.
//!
//! Random allocate/free sequences are replayed against each allocator while a
//! simple model tracks the live ranges:
//! - live allocations never overlap and stay inside the managed range
//! - freeing everything restores a fully free allocator
//! - the two pool backends hand out identical addresses
//! - the memory stack never loses or duplicates a block

use kernel_region_alloc::{
    BlockBitmap, DynamicMemoryPool, MemoryStack, PoolGeometry, PoolNode, Run, StaticMemoryPool,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate(u64),
    /// Free the live allocation at this index (modulo the live count).
    Free(usize),
}

fn arb_ops(max_size: u64) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (1..=max_size).prop_map(Op::Allocate),
            2 => any::<usize>().prop_map(Op::Free),
        ],
        1..64,
    )
}

fn assert_disjoint(live: &[(u64, u64)], start: u64, end: u64) {
    let mut sorted = live.to_vec();
    sorted.sort_unstable();
    for &(address, len) in &sorted {
        assert!(address >= start && address + len <= end, "0x{address:X} escapes range");
    }
    for pair in sorted.windows(2) {
        let (a, a_len) = pair[0];
        let (b, _) = pair[1];
        assert!(a + a_len <= b, "0x{a:X} (+0x{a_len:X}) overlaps 0x{b:X}");
    }
}

/// Footprint of a pool allocation: the smallest power-of-two node that fits.
fn pool_footprint(size: u64, chunk_size: u64) -> u64 {
    size.next_power_of_two().max(chunk_size)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn bitmap_allocations_are_disjoint(ops in arb_ops(0x900)) {
        const BASE: u64 = 0x10_0000;
        const END: u64 = 0x11_0000;
        const BLOCK: u64 = 0x100;

        let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
        let mut live: Vec<(u64, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    if let Some(address) = bitmap.allocate(size) {
                        live.push((address, size.div_ceil(BLOCK) * BLOCK));
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let (address, len) = live.swap_remove(i % live.len());
                    prop_assert!(bitmap.free(address, len).is_ok());
                }
                Op::Free(_) => {}
            }
            assert_disjoint(&live, BASE, END);
        }

        for (address, len) in live {
            prop_assert!(bitmap.free(address, len).is_ok());
        }
        prop_assert_eq!(bitmap.statistics().blocks_allocated, 0);
    }

    #[test]
    fn pool_allocations_are_disjoint_and_merge_back(ops in arb_ops(0x4000)) {
        let geometry = PoolGeometry::new(0x40_0000, 0x1_0000, 0x400);
        let pool = DynamicMemoryPool::new(geometry.start(), geometry.length(), geometry.chunk_size())
            .unwrap();
        let end = geometry.start() + geometry.length();
        let mut live: Vec<(u64, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    if let Some(address) = pool.allocate(size) {
                        let len = pool_footprint(size, geometry.chunk_size());
                        prop_assert_eq!(address % len, 0, "node not naturally aligned");
                        live.push((address, len));
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let (address, _) = live.swap_remove(i % live.len());
                    prop_assert!(pool.free(address).is_ok());
                }
                Op::Free(_) => {}
            }
            assert_disjoint(&live, geometry.start(), end);
            let used: u64 = live.iter().map(|&(_, len)| len).sum();
            prop_assert_eq!(pool.available(), geometry.length() - used);
        }

        for (address, _) in live {
            prop_assert!(pool.free(address).is_ok());
        }
        prop_assert_eq!(pool.allocate(geometry.length()), Some(geometry.start()));
    }

    #[test]
    fn pool_backends_hand_out_identical_addresses(ops in arb_ops(0x2000)) {
        let geometry = PoolGeometry::new(0, 0x8000, 0x200);
        let dynamic = DynamicMemoryPool::new(0, 0x8000, 0x200).unwrap();
        let mut storage = vec![PoolNode::new(); geometry.node_count()];
        let mut fixed = StaticMemoryPool::new(&mut storage, 0, 0x8000, 0x200).unwrap();
        let mut live: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    let address = dynamic.allocate(size);
                    prop_assert_eq!(address, fixed.allocate(size));
                    live.extend(address);
                }
                Op::Free(i) if !live.is_empty() => {
                    let address = live.swap_remove(i % live.len());
                    prop_assert_eq!(dynamic.free(address), fixed.free(address));
                }
                Op::Free(_) => {}
            }
        }
        prop_assert_eq!(dynamic.available(), fixed.available());
    }

    #[test]
    fn pool_containment_ignores_state(
        start_page in 0u64..0x1000,
        length_shift in 12u32..24,
        probe in any::<u64>(),
    ) {
        let start = start_page << 24;
        let length = 1u64 << length_shift;
        let pool = DynamicMemoryPool::new(start, length, 0x1000).unwrap();
        let inside = probe >= start && probe < start + length;

        prop_assert_eq!(pool.contains(probe), inside);
        let _ = pool.allocate(length);
        prop_assert_eq!(pool.contains(probe), inside);
        prop_assert!(pool.contains(start));
        prop_assert!(!pool.contains(start + length));
    }

    #[test]
    fn stack_conserves_blocks(
        runs in prop::collection::vec((0u64..64, 1usize..8), 1..32),
        pops in prop::collection::vec(0usize..16, 0..16),
    ) {
        let mut stack = MemoryStack::new(0x1000, size_of::<Run>()).unwrap();
        let mut pushed = 0;
        for (i, (slot, count)) in runs.into_iter().enumerate() {
            // each pushed run gets its own 32-page window, so runs never overlap
            let base = (i as u64 * 64 + slot % 32) * 0x20_000;
            stack.push(base, count).unwrap();
            pushed += count;
        }
        prop_assert_eq!(stack.free_blocks(), pushed);

        let mut seen = Vec::new();
        for n in pops {
            let mut out = vec![0; n];
            let popped = stack.pop(&mut out).filled();
            prop_assert!(popped <= n);
            seen.extend_from_slice(&out[..popped]);
        }

        prop_assert_eq!(seen.len() + stack.free_blocks(), pushed);
        seen.sort_unstable();
        let before = seen.len();
        seen.dedup();
        prop_assert_eq!(seen.len(), before, "a block was handed out twice");
    }
}
