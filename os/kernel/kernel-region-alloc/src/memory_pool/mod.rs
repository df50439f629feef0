//! # Binary-Tree Memory Pools
//!
//! A memory pool manages a power-of-two sized range as a complete binary tree.
//! The root covers the whole range; every node covers `length >> depth`
//! bytes, and the leaves at the bottom level cover exactly `chunk_size`.
//!
//! ```text
//! depth 0   [──────────────────── length ────────────────────]
//! depth 1   [──── right (low half) ───][──── left (high half) ─]
//! depth 2   [─ right ─][─── left ─────][─ right ─][─── left ───]
//!            ^ start                    ^ start + length/2
//! ```
//!
//! The **right** child covers the lower half of its parent and is always
//! tried first, which makes address assignment deterministic.
//!
//! ## Node states
//!
//! Each node carries two flags ([`PoolNode`]):
//!
//! | `split` | `allocated` | meaning                                           |
//! |---------|-------------|---------------------------------------------------|
//! | 0       | 0           | whole range free                                  |
//! | 1       | 0           | subdivided, at least one descendant has room      |
//! | 0       | 1           | allocated leaf                                    |
//! | 1       | 1           | both children fully allocated (search pruning)    |
//!
//! An allocation descends until the next level would be too small for the
//! request (or the chunk size is reached) and claims that node whole. Freeing
//! walks down by address, clears the leaf and repairs the flags on the way
//! back up, merging siblings that are both free again.
//!
//! ## Backends
//!
//! The algorithm below is written once against [`NodeStore`] and used by
//! two storage backends:
//!
//! * [`DynamicMemoryPool`]: nodes live in a heap arena and child pairs are
//!   created the first time a node splits. Internally locked.
//! * [`StaticMemoryPool`]: every node is preallocated in a caller-supplied
//!   slice indexed as a binary heap. No heap use and no lock; meant for early
//!   boot.

mod dynamic_pool;
mod static_pool;

pub use dynamic_pool::DynamicMemoryPool;
pub use static_pool::StaticMemoryPool;

use crate::error::{RegionError, StorageError};
use bitfield_struct::bitfield;
use log::warn;

/// Flags of one tree node.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct PoolNode {
    /// The node has been subdivided into two children.
    pub split: bool,
    /// The node's whole range is unavailable.
    pub allocated: bool,
    #[bits(6)]
    __: u8,
}

/// Start, length and granularity of a memory pool.
///
/// Both `length` and `chunk_size` are powers of two with
/// `chunk_size <= length`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolGeometry {
    start: u64,
    length: u64,
    chunk_size: u64,
}

impl PoolGeometry {
    /// # Panics
    /// If `length` or `chunk_size` is not a power of two, if
    /// `chunk_size > length`, or if the range wraps the address space.
    #[must_use]
    pub const fn new(start: u64, length: u64, chunk_size: u64) -> Self {
        assert!(length.is_power_of_two(), "pool length must be a power of two");
        assert!(
            chunk_size.is_power_of_two(),
            "pool chunk size must be a power of two"
        );
        assert!(chunk_size <= length, "pool chunk size exceeds its length");
        assert!(
            start.checked_add(length - 1).is_some(),
            "pool range wraps the address space"
        );
        Self {
            start,
            length,
            chunk_size,
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    #[inline]
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of times the root can be halved before reaching `chunk_size`.
    #[inline]
    #[must_use]
    pub const fn levels(&self) -> u32 {
        self.length.trailing_zeros() - self.chunk_size.trailing_zeros()
    }

    /// Nodes in the complete tree, `2^(levels + 1) - 1`.
    ///
    /// Saturates at `usize::MAX` for trees no address space could hold.
    #[must_use]
    pub const fn node_count(&self) -> usize {
        match 1usize.checked_shl(self.levels() + 1) {
            Some(n) => n - 1,
            None => usize::MAX,
        }
    }

    /// `true` iff `start <= address < start + length`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.start && address - self.start < self.length
    }

    /// Size of a node at `depth`.
    #[inline]
    const fn range_at(&self, depth: u32) -> u64 {
        self.length >> depth
    }
}

/// Storage backend for pool nodes. The root is always index `0`.
pub(crate) trait NodeStore {
    fn node(&self, index: usize) -> PoolNode;

    fn node_mut(&mut self, index: usize) -> &mut PoolNode;

    /// `(right, left)` children of `index`, if they exist.
    fn children(&self, index: usize) -> Option<(usize, usize)>;

    /// Like [`children`](Self::children), creating them if the backend
    /// materializes nodes lazily.
    fn materialize_children(&mut self, index: usize) -> Result<(usize, usize), StorageError>;
}

/// Claim the first node that fits `size`.
///
/// Sizes of zero or larger than the pool are rejected before touching the tree.
pub(crate) fn allocate<S>(store: &mut S, geometry: &PoolGeometry, size: u64) -> Option<u64>
where
    S: NodeStore + ?Sized,
{
    if size == 0 || size > geometry.length {
        return None;
    }
    allocate_at(store, geometry, 0, 0, geometry.start, size)
}

fn allocate_at<S>(
    store: &mut S,
    geometry: &PoolGeometry,
    index: usize,
    depth: u32,
    address: u64,
    size: u64,
) -> Option<u64>
where
    S: NodeStore + ?Sized,
{
    let node = store.node(index);
    if node.allocated() {
        return None;
    }

    let range = geometry.range_at(depth);
    let next = range >> 1;

    let (right, left) = if node.split() {
        // Taking a whole split node would need both halves; never fragment
        // for a request a single child cannot satisfy.
        if size > next {
            return None;
        }
        store.children(index)?
    } else if range == geometry.chunk_size || size > next {
        store.node_mut(index).set_allocated(true);
        return Some(address);
    } else {
        let children = store.materialize_children(index).ok()?;
        store.node_mut(index).set_split(true);
        children
    };

    let result = match allocate_at(store, geometry, right, depth + 1, address, size) {
        Some(found) => Some(found),
        None => allocate_at(store, geometry, left, depth + 1, address + next, size),
    };

    match result {
        Some(_) => {
            if store.node(right).allocated() && store.node(left).allocated() {
                store.node_mut(index).set_allocated(true);
            }
        }
        // Split during this call but nothing below could be claimed.
        None if !node.split() => store.node_mut(index).set_split(false),
        None => {}
    }
    result
}

/// Release the allocation containing `address`.
///
/// # Errors
/// - [`RegionError::OutOfRange`] if the pool does not cover `address`.
/// - [`RegionError::NotAllocated`] if no allocated node contains `address`.
pub(crate) fn free<S>(store: &mut S, geometry: &PoolGeometry, address: u64) -> Result<(), RegionError>
where
    S: NodeStore + ?Sized,
{
    let result = if !geometry.contains(address) {
        Err(RegionError::OutOfRange { address })
    } else if free_at(store, geometry, 0, 0, geometry.start, address) {
        Ok(())
    } else {
        Err(RegionError::NotAllocated { address })
    };

    if let Err(e) = result {
        warn!(
            "memory pool 0x{:016X}: failed to free 0x{address:016X}: {e}",
            geometry.start
        );
    }
    result
}

fn free_at<S>(
    store: &mut S,
    geometry: &PoolGeometry,
    index: usize,
    depth: u32,
    address: u64,
    target: u64,
) -> bool
where
    S: NodeStore + ?Sized,
{
    let node = store.node(index);
    let range = geometry.range_at(depth);

    if node.split() {
        let Some((right, left)) = store.children(index) else {
            return false;
        };

        let half = range >> 1;
        let freed = if target - address < half {
            free_at(store, geometry, right, depth + 1, address, target)
        } else {
            free_at(store, geometry, left, depth + 1, address + half, target)
        };

        if freed {
            let (r, l) = (store.node(right), store.node(left));
            let parent = store.node_mut(index);
            parent.set_allocated(r.allocated() && l.allocated());
            if !r.allocated() && !l.allocated() && !r.split() && !l.split() {
                parent.set_split(false);
            }
        }
        freed
    } else if node.allocated() && target >= address && target - address < range {
        store.node_mut(index).set_allocated(false);
        true
    } else {
        false
    }
}

/// Bytes not covered by any allocation.
pub(crate) fn available<S>(store: &S, geometry: &PoolGeometry) -> u64
where
    S: NodeStore + ?Sized,
{
    available_at(store, geometry, 0, 0)
}

fn available_at<S>(store: &S, geometry: &PoolGeometry, index: usize, depth: u32) -> u64
where
    S: NodeStore + ?Sized,
{
    let node = store.node(index);
    if node.allocated() {
        0
    } else if node.split() {
        store.children(index).map_or(0, |(right, left)| {
            available_at(store, geometry, right, depth + 1)
                + available_at(store, geometry, left, depth + 1)
        })
    } else {
        geometry.range_at(depth)
    }
}
