use super::{NodeStore, PoolGeometry, PoolNode};
use crate::RegionAllocator;
use crate::error::{RegionError, StorageError};
use crate::sync::RegionLock;
use alloc::vec::Vec;
use log::{debug, trace};

/// Heap-backed memory pool that grows its tree on demand.
///
/// Nodes are kept in an index arena: a node's children are appended as an
/// adjacent `(right, left)` pair the first time it splits and stay in the arena
/// afterwards, to be reused if the node splits again. Dropping the pool drops
/// the arena in one go, so deep trees cannot overflow the stack on teardown.
///
/// All operations take an interrupt-safe lock.
pub struct DynamicMemoryPool {
    geometry: PoolGeometry,
    arena: RegionLock<NodeArena>,
}

struct NodeArena {
    nodes: Vec<PoolNode>,
    /// Arena index of the right child; the left child follows it. `0` means
    /// "not materialized" since the root is never anyone's child.
    first_child: Vec<u32>,
}

impl DynamicMemoryPool {
    /// # Errors
    /// [`StorageError::OutOfMemory`] if the root node cannot be allocated.
    ///
    /// # Panics
    /// On invalid geometry, see [`PoolGeometry::new`].
    pub fn new(start: u64, length: u64, chunk_size: u64) -> Result<Self, StorageError> {
        let geometry = PoolGeometry::new(start, length, chunk_size);

        let mut arena = NodeArena {
            nodes: Vec::new(),
            first_child: Vec::new(),
        };
        arena.push_nodes(1)?;

        debug!(
            "dynamic memory pool 0x{start:016X} (+0x{length:X}), chunk 0x{chunk_size:X}"
        );
        Ok(Self {
            geometry,
            arena: RegionLock::new(arena),
        })
    }

    #[inline]
    #[must_use]
    pub const fn geometry(&self) -> &PoolGeometry {
        &self.geometry
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.geometry.start()
    }

    #[inline]
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.geometry.length()
    }

    #[inline]
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.geometry.chunk_size()
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        self.geometry.contains(address)
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Returns `None` if `size` is zero, exceeds the pool, or no free node is
    /// large enough. Running out of heap for new nodes also yields `None`.
    pub fn allocate(&self, size: u64) -> Option<u64> {
        let address = {
            let mut arena = self.arena.lock();
            super::allocate(&mut *arena, &self.geometry, size)
        };
        trace!("dynamic memory pool allocate 0x{size:X} => {address:X?}");
        address
    }

    /// Release the allocation containing `address`.
    ///
    /// # Errors
    /// [`RegionError`] if `address` is outside the pool or not allocated.
    pub fn free(&self, address: u64) -> Result<(), RegionError> {
        trace!("dynamic memory pool free 0x{address:016X}");
        let mut arena = self.arena.lock();
        super::free(&mut *arena, &self.geometry, address)
    }

    /// Bytes not covered by any allocation.
    #[must_use]
    pub fn available(&self) -> u64 {
        let arena = self.arena.lock();
        super::available(&*arena, &self.geometry)
    }

    /// Number of tree nodes created so far.
    #[must_use]
    pub fn materialized_nodes(&self) -> usize {
        self.arena.lock().nodes.len()
    }
}

impl NodeArena {
    fn push_nodes(&mut self, count: usize) -> Result<(), StorageError> {
        let oom = |_| StorageError::OutOfMemory {
            bytes: count * (size_of::<PoolNode>() + size_of::<u32>()),
        };
        self.nodes.try_reserve(count).map_err(oom)?;
        self.first_child.try_reserve(count).map_err(oom)?;
        for _ in 0..count {
            self.nodes.push(PoolNode::new());
            self.first_child.push(0);
        }
        Ok(())
    }
}

impl NodeStore for NodeArena {
    #[inline]
    fn node(&self, index: usize) -> PoolNode {
        self.nodes[index]
    }

    #[inline]
    fn node_mut(&mut self, index: usize) -> &mut PoolNode {
        &mut self.nodes[index]
    }

    #[inline]
    fn children(&self, index: usize) -> Option<(usize, usize)> {
        match self.first_child[index] {
            0 => None,
            right => Some((right as usize, right as usize + 1)),
        }
    }

    fn materialize_children(&mut self, index: usize) -> Result<(usize, usize), StorageError> {
        if let Some(children) = self.children(index) {
            return Ok(children);
        }

        let right = self.nodes.len();
        let link = u32::try_from(right).map_err(|_| StorageError::OutOfMemory {
            bytes: 2 * size_of::<PoolNode>(),
        })?;
        self.push_nodes(2)?;
        self.first_child[index] = link;
        Ok((right, right + 1))
    }
}

impl RegionAllocator for DynamicMemoryPool {
    fn allocate(&mut self, size: u64) -> Option<u64> {
        Self::allocate(self, size)
    }

    fn free(&mut self, address: u64, _size: u64) -> Result<(), RegionError> {
        Self::free(self, address)
    }

    fn contains(&self, address: u64) -> bool {
        Self::contains(self, address)
    }
}
