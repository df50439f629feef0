//! # Block Bitmap
//!
//! A first-fit allocator over a contiguous address range split into equally
//! sized blocks. One bit tracks one block:
//!
//! ```text
//! base                                                          end
//! ├──────┬──────┬──────┬──────┬──────┬──────┬─── ─ ─ ─┬──────┤
//! │  b0  │  b1  │  b2  │  b3  │  b4  │  b5  │         │ bN-1 │
//! └──────┴──────┴──────┴──────┴──────┴──────┴─── ─ ─ ─┴──────┘
//!  word 0, bit 0 ──► block 0          word i, bit j ──► block 64i + j
//! ```
//!
//! Allocation scans the words from the start of the range, skips full words,
//! and takes the **first** run of free bits that is long enough. It is not
//! best-fit: a tighter hole further up is never preferred.
//!
//! All operations, including the read-only [`BlockBitmap::validate`], run
//! under one spin lock, so a scan never observes a half-written run.

use crate::RegionAllocator;
use crate::error::{RegionError, StorageError};
use crate::sync::RegionLock;
use alloc::vec::Vec;
use log::{debug, trace, warn};

const WORD_BITS: usize = u64::BITS as usize;

/// Allocation state of a queried run of blocks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockState {
    /// Every block in the run is allocated.
    Allocated,
    /// No block in the run is allocated.
    Free,
    /// Some, but not all, blocks are allocated.
    Mixed,
}

/// Usage counters of a [`BlockBitmap`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BitmapStatistics {
    pub block_count: usize,
    pub blocks_allocated: usize,
    pub num_allocations: usize,
    pub num_frees: usize,
}

/// Bitmap-backed first-fit block allocator for `[base, end)`.
pub struct BlockBitmap {
    base: u64,
    end: u64,
    block_size: u64,
    block_count: usize,
    state: RegionLock<BitmapState>,
}

/// Everything mutated by allocate/free; lives behind the lock.
struct BitmapState {
    words: Vec<u64>,
    block_count: usize,
    blocks_allocated: usize,
    num_allocations: usize,
    num_frees: usize,
}

impl BlockBitmap {
    /// Create an allocator for `[base, end)` handing out `block_size` units.
    ///
    /// Trailing bytes that do not fill a whole block are not managed.
    ///
    /// # Errors
    /// [`StorageError::OutOfMemory`] if the bitmap words cannot be allocated.
    ///
    /// # Panics
    /// If `end <= base` or `block_size == 0`.
    pub fn new(base: u64, end: u64, block_size: u64) -> Result<Self, StorageError> {
        assert!(end > base, "empty bitmap range 0x{base:X}..0x{end:X}");
        assert!(block_size > 0, "block size must be non-zero");

        let block_count = usize::try_from((end - base) / block_size).map_err(|_| {
            StorageError::OutOfMemory {
                bytes: usize::MAX,
            }
        })?;
        let word_count = block_count.div_ceil(WORD_BITS);

        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| StorageError::OutOfMemory {
                bytes: word_count * size_of::<u64>(),
            })?;
        words.resize(word_count, 0);

        debug!(
            "block bitmap 0x{base:016X}..0x{end:016X}: {block_count} blocks of 0x{block_size:X} bytes"
        );

        Ok(Self {
            base,
            end,
            block_size,
            block_count,
            state: RegionLock::new(BitmapState {
                words,
                block_count,
                blocks_allocated: 0,
                num_allocations: 0,
                num_frees: 0,
            }),
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    #[inline]
    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.block_count
    }

    /// `true` iff `base <= address < end`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end
    }

    /// Allocate `size` bytes rounded up to whole blocks (first fit).
    ///
    /// Returns `None` for `size == 0` or when no free run is long enough.
    pub fn allocate(&self, size: u64) -> Option<u64> {
        let blocks = self.blocks_for(size)?;
        let start = {
            let mut state = self.state.lock();
            state.find_run(blocks).inspect(|&start| {
                state.set_run(start, blocks);
                state.num_allocations += 1;
            })
        };

        let address = start.map(|bit| self.address_of(bit));
        trace!("block bitmap allocate 0x{size:X} => {address:X?}");
        address
    }

    /// Mark `[address, address + size)` as allocated regardless of its
    /// current state, e.g. to carve out a range the caller already occupies.
    /// Only a reservation that claims at least one free block counts as an
    /// allocation.
    ///
    /// # Errors
    /// [`RegionError::OutOfRange`] if `address` is not managed.
    pub fn reserve(&self, address: u64, size: u64) -> Result<(), RegionError> {
        let (start, blocks) = self.run_of(address, size)?;
        let newly_set = {
            let mut state = self.state.lock();
            let newly_set = state.set_run(start, blocks);
            if newly_set > 0 {
                state.num_allocations += 1;
            }
            newly_set
        };
        trace!("block bitmap reserve 0x{address:016X} (+0x{size:X}) => {newly_set} blocks");
        Ok(())
    }

    /// Release the blocks covering `[address, address + size)`.
    ///
    /// # Errors
    /// - [`RegionError::OutOfRange`] if `address` is not managed.
    /// - [`RegionError::NotAllocated`] if none of the blocks were allocated.
    pub fn free(&self, address: u64, size: u64) -> Result<(), RegionError> {
        let (start, blocks) = self.run_of(address, size).inspect_err(|e| {
            warn!("block bitmap: refusing to free 0x{address:016X}: {e}");
        })?;

        let cleared = {
            let mut state = self.state.lock();
            let cleared = state.clear_run(start, blocks);
            if cleared > 0 {
                state.num_frees += 1;
            }
            cleared
        };

        trace!("block bitmap free 0x{address:016X} (+0x{size:X}) => {cleared} blocks");
        if cleared == 0 {
            warn!("block bitmap: double free of 0x{address:016X}");
            return Err(RegionError::NotAllocated { address });
        }
        Ok(())
    }

    /// Report whether the blocks covering `[address, address + size)` are
    /// allocated. A `size` of zero queries the single block at `address`.
    ///
    /// Takes the lock, so it never races a concurrent allocate or free.
    ///
    /// # Errors
    /// [`RegionError::OutOfRange`] if `address` is not managed.
    pub fn validate(&self, address: u64, size: u64) -> Result<BlockState, RegionError> {
        let (start, blocks) = self.run_of(address, size)?;
        let set = {
            let state = self.state.lock();
            (start..start + blocks)
                .filter(|&bit| state.is_set(bit))
                .count()
        };
        Ok(match set {
            0 => BlockState::Free,
            n if n == blocks => BlockState::Allocated,
            _ => BlockState::Mixed,
        })
    }

    #[must_use]
    pub fn statistics(&self) -> BitmapStatistics {
        let state = self.state.lock();
        BitmapStatistics {
            block_count: state.block_count,
            blocks_allocated: state.blocks_allocated,
            num_allocations: state.num_allocations,
            num_frees: state.num_frees,
        }
    }

    /// Number of whole blocks needed for `size` bytes; `None` if zero or more
    /// than the bitmap can ever hold.
    fn blocks_for(&self, size: u64) -> Option<usize> {
        let blocks = usize::try_from(size.div_ceil(self.block_size)).ok()?;
        (blocks != 0 && blocks <= self.block_count).then_some(blocks)
    }

    /// Translate a byte range into `(first block, block count)`, clamped to
    /// the end of the bitmap. A zero `size` still names the block at `address`.
    fn run_of(&self, address: u64, size: u64) -> Result<(usize, usize), RegionError> {
        if !self.contains(address) {
            return Err(RegionError::OutOfRange { address });
        }
        let start = usize::try_from((address - self.base) / self.block_size)
            .map_err(|_| RegionError::OutOfRange { address })?;
        if start >= self.block_count {
            return Err(RegionError::OutOfRange { address });
        }
        let blocks = usize::try_from(size.div_ceil(self.block_size)).unwrap_or(usize::MAX);
        Ok((start, blocks.clamp(1, self.block_count - start)))
    }

    #[inline]
    fn address_of(&self, bit: usize) -> u64 {
        self.base + bit as u64 * self.block_size
    }
}

impl BitmapState {
    #[inline]
    fn is_set(&self, bit: usize) -> bool {
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// First-fit search for `blocks` consecutive clear bits.
    fn find_run(&self, blocks: usize) -> Option<usize> {
        for (word_index, &word) in self.words.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }

            for bit in 0..WORD_BITS {
                let start = word_index * WORD_BITS + bit;
                if start + blocks > self.block_count {
                    // Every later start is even closer to the end.
                    return None;
                }
                if word & (1 << bit) != 0 {
                    continue;
                }

                // Probe forward; `is_set` recomputes word/bit so the run may
                // span word boundaries.
                if (start + 1..start + blocks).all(|probe| !self.is_set(probe)) {
                    return Some(start);
                }
            }
        }
        None
    }

    /// Set every bit in the run; returns how many were previously clear.
    fn set_run(&mut self, start: usize, blocks: usize) -> usize {
        let mut newly_set = 0;
        for bit in start..start + blocks {
            let mask = 1 << (bit % WORD_BITS);
            let word = &mut self.words[bit / WORD_BITS];
            if *word & mask == 0 {
                *word |= mask;
                newly_set += 1;
            }
        }
        self.blocks_allocated += newly_set;
        newly_set
    }

    /// Clear every bit in the run; returns how many were previously set.
    fn clear_run(&mut self, start: usize, blocks: usize) -> usize {
        let mut cleared = 0;
        for bit in start..start + blocks {
            let mask = 1 << (bit % WORD_BITS);
            let word = &mut self.words[bit / WORD_BITS];
            if *word & mask != 0 {
                *word &= !mask;
                cleared += 1;
            }
        }
        self.blocks_allocated -= cleared;
        cleared
    }
}

impl RegionAllocator for BlockBitmap {
    fn allocate(&mut self, size: u64) -> Option<u64> {
        Self::allocate(self, size)
    }

    fn free(&mut self, address: u64, size: u64) -> Result<(), RegionError> {
        Self::free(self, address, size)
    }

    fn contains(&self, address: u64) -> bool {
        Self::contains(self, address)
    }
}
