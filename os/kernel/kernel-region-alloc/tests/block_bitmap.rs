use kernel_region_alloc::{BlockBitmap, BlockState, RegionError};
use std::sync::{Arc, Barrier};
use std::thread;

const BASE: u64 = 0x1000;
const END: u64 = 0x2000;
const BLOCK: u64 = 0x100;

#[test]
fn first_fit_skips_leading_allocations() {
    let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
    assert_eq!(bitmap.allocate(2 * BLOCK), Some(0x1000));

    // blocks 0 and 1 are taken, three more land right after them
    assert_eq!(bitmap.allocate(3 * BLOCK), Some(0x1200));
    assert_eq!(bitmap.validate(0x1000, 5 * BLOCK), Ok(BlockState::Allocated));
    assert_eq!(bitmap.validate(0x1500, BLOCK), Ok(BlockState::Free));
}

#[test]
fn sizes_round_up_to_whole_blocks() {
    let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
    assert_eq!(bitmap.allocate(1), Some(0x1000));
    assert_eq!(bitmap.allocate(BLOCK + 1), Some(0x1100));
    assert_eq!(bitmap.statistics().blocks_allocated, 3);
}

#[test]
fn zero_and_oversized_requests_fail() {
    let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
    assert_eq!(bitmap.allocate(0), None);
    assert_eq!(bitmap.allocate(END - BASE + 1), None);
    assert_eq!(bitmap.statistics().num_allocations, 0);
}

#[test]
fn exhaustion_never_leaves_the_range() {
    let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
    let mut got = Vec::new();
    while let Some(address) = bitmap.allocate(3 * BLOCK) {
        assert!(bitmap.contains(address));
        assert!(address + 3 * BLOCK <= END);
        got.push(address);
    }
    // 16 blocks hold five runs of three
    assert_eq!(got.len(), 5);
    assert_eq!(bitmap.allocate(BLOCK), Some(0x1F00));
    assert_eq!(bitmap.allocate(BLOCK), None);
}

#[test]
fn free_then_allocate_returns_same_address() {
    let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
    let _head = bitmap.allocate(BLOCK).unwrap();
    let a = bitmap.allocate(4 * BLOCK).unwrap();
    let before = bitmap.statistics();

    bitmap.free(a, 4 * BLOCK).unwrap();
    assert_eq!(bitmap.validate(a, 4 * BLOCK), Ok(BlockState::Free));
    assert_eq!(bitmap.allocate(4 * BLOCK), Some(a));

    let after = bitmap.statistics();
    assert_eq!(after.blocks_allocated, before.blocks_allocated);
    assert_eq!(after.num_frees, 1);
}

#[test]
fn double_free_is_reported() {
    let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
    let a = bitmap.allocate(BLOCK).unwrap();
    bitmap.free(a, BLOCK).unwrap();
    assert_eq!(
        bitmap.free(a, BLOCK),
        Err(RegionError::NotAllocated { address: a })
    );
    assert_eq!(bitmap.statistics().num_frees, 1);
}

#[test]
fn foreign_addresses_are_rejected() {
    let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
    assert_eq!(
        bitmap.free(END, BLOCK),
        Err(RegionError::OutOfRange { address: END })
    );
    assert_eq!(
        bitmap.validate(0, BLOCK),
        Err(RegionError::OutOfRange { address: 0 })
    );
    assert!(!bitmap.contains(BASE - 1));
    assert!(bitmap.contains(END - 1));
}

#[test]
fn mixed_state_is_detected() {
    let bitmap = BlockBitmap::new(BASE, END, BLOCK).unwrap();
    bitmap.reserve(0x1100, BLOCK).unwrap();
    assert_eq!(bitmap.validate(0x1000, 3 * BLOCK), Ok(BlockState::Mixed));
    assert_eq!(bitmap.validate(0x1100, 0), Ok(BlockState::Allocated));
}

#[test]
fn concurrent_validate_and_allocate() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 16;

    // 8 * 16 runs of two blocks, exactly filling the bitmap
    let bitmap = Arc::new(
        BlockBitmap::new(0, (THREADS * PER_THREAD * 2) as u64 * 0x1000, 0x1000).unwrap(),
    );
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let bitmap = Arc::clone(&bitmap);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut mine = Vec::with_capacity(PER_THREAD);
                for _ in 0..PER_THREAD {
                    let a = bitmap.allocate(0x2000).expect("bitmap sized for all threads");
                    assert_eq!(bitmap.validate(a, 0x2000), Ok(BlockState::Allocated));
                    mine.push(a);
                    thread::yield_now();
                }
                mine
            })
        })
        .collect();

    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();

    assert_eq!(all.len(), THREADS * PER_THREAD);
    for pair in all.windows(2) {
        assert!(pair[1] - pair[0] >= 0x2000, "overlapping allocations");
    }

    let stats = bitmap.statistics();
    assert_eq!(stats.blocks_allocated, stats.block_count);
    assert_eq!(bitmap.allocate(1), None);
}
