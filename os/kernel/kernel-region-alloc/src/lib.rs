//! # Kernel Region Allocators
//!
//! Allocators that hand out pieces of a fixed address range. They manage
//! *addresses*, never the memory behind them, so the same code tracks
//! physical frames, virtual address windows or device apertures.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 physical / virtual memory manager            │
//! │  (routes each request to the allocator whose range fits)     │
//! └──────┬──────────────────────┬──────────────────────┬─────────┘
//!        │                      │                      │
//! ┌──────▼───────┐     ┌────────▼────────┐     ┌───────▼────────┐
//! │ BlockBitmap  │     │  Memory pools   │     │  MemoryStack   │
//! │ 1 bit/block  │     │ binary tree of  │     │ LIFO of free   │
//! │ first-fit    │     │ power-of-two    │     │ page runs      │
//! │ contiguous   │     │ buddies         │     │                │
//! └──────────────┘     └─────────────────┘     └────────────────┘
//! ```
//!
//! ## Components
//!
//! * [`block_bitmap`]: fixed-size blocks over `[base, end)`, contiguous
//!   first-fit allocation, double-free detection and range validation.
//!   Internally locked; usable through `&self` from several cores.
//! * [`memory_pool`]: buddy-style pools over a power-of-two range. The
//!   [`DynamicMemoryPool`] grows its tree from the heap as needed, the
//!   [`StaticMemoryPool`] runs on a caller-provided node array during boot.
//! * [`memory_stack`]: a growable stack of free page runs with
//!   neighbour merging, used by the physical memory manager.
//! * `sync`: the interrupt-masking spin lock the locked allocators share.
//!
//! Range-style allocators implement [`RegionAllocator`] so a manager can
//! keep a heterogeneous list and route frees by [`RegionAllocator::contains`].
//!
//! ## Example
//!
//! ```rust
//! use kernel_region_alloc::{BlockBitmap, DynamicMemoryPool, RegionAllocator};
//!
//! let mut regions: Vec<Box<dyn RegionAllocator>> = vec![
//!     Box::new(BlockBitmap::new(0x1000, 0x2000, 0x100).unwrap()),
//!     Box::new(DynamicMemoryPool::new(0x10_0000, 0x1_0000, 0x1000).unwrap()),
//! ];
//!
//! let address = regions[1].allocate(0x3000).unwrap();
//! assert_eq!(address, 0x10_0000);
//!
//! let owner = regions.iter_mut().find(|r| r.contains(address)).unwrap();
//! owner.free(address, 0x3000).unwrap();
//! ```
//!
//! ## Memory
//!
//! The crate is `no_std` and uses `alloc` for bitmap words, pool nodes and
//! stack entries. Every heap reservation goes through `try_reserve*`, so
//! running out of memory surfaces as [`StorageError::OutOfMemory`] (or as a
//! failed allocation) rather than an abort.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod block_bitmap;
pub mod error;
pub mod memory_pool;
pub mod memory_stack;
mod sync;

pub use block_bitmap::{BitmapStatistics, BlockBitmap, BlockState};
pub use error::{PushError, RegionError, StorageError};
pub use memory_pool::{DynamicMemoryPool, PoolGeometry, PoolNode, StaticMemoryPool};
pub use memory_stack::{MemoryStack, Pop, Run, StorageRelocation};

/// An allocator handing out addresses from one contiguous range.
pub trait RegionAllocator {
    /// Allocate `size` bytes; `None` if the request cannot be satisfied.
    fn allocate(&mut self, size: u64) -> Option<u64>;

    /// Release an allocation made by [`allocate`](Self::allocate).
    ///
    /// Allocators that track allocation sizes themselves ignore `size`.
    ///
    /// # Errors
    /// [`RegionError`] if `address` is outside the range or not allocated.
    fn free(&mut self, address: u64, size: u64) -> Result<(), RegionError>;

    /// Whether `address` lies inside the managed range.
    fn contains(&self, address: u64) -> bool;
}
