use super::{NodeStore, PoolGeometry, PoolNode};
use crate::RegionAllocator;
use crate::error::{RegionError, StorageError};
use log::{debug, trace};

/// Memory pool over a caller-supplied, fully preallocated node array.
///
/// Nodes are laid out as a binary heap: node `i` has its left child at
/// `2i + 1` and its right child at `2i + 2`. Size the storage with
/// [`StaticMemoryPool::node_count`] (or [`StaticMemoryPool::calculate_size`]
/// when carving raw memory) before constructing the pool.
///
/// There is no internal lock. The pool is used during early boot while only
/// one execution context exists; every mutating call takes `&mut self`, so
/// sharing it later requires an outer lock.
pub struct StaticMemoryPool<'s> {
    geometry: PoolGeometry,
    nodes: &'s mut [PoolNode],
}

impl<'s> StaticMemoryPool<'s> {
    /// Number of nodes a pool of `length` bytes with `chunk_size` leaves needs.
    ///
    /// # Panics
    /// On invalid geometry, see [`PoolGeometry::new`].
    #[must_use]
    pub const fn node_count(length: u64, chunk_size: u64) -> usize {
        PoolGeometry::new(0, length, chunk_size).node_count()
    }

    /// Bytes of backing storage a pool of `length` bytes with `chunk_size`
    /// leaves needs.
    ///
    /// # Panics
    /// On invalid geometry, see [`PoolGeometry::new`].
    #[must_use]
    pub const fn calculate_size(length: u64, chunk_size: u64) -> usize {
        Self::node_count(length, chunk_size).saturating_mul(size_of::<PoolNode>())
    }

    /// Build a pool over `storage`, clearing every node in it.
    ///
    /// # Errors
    /// [`StorageError::TooSmall`] if `storage` holds fewer nodes than
    /// [`node_count`](Self::node_count) requires.
    ///
    /// # Panics
    /// On invalid geometry, see [`PoolGeometry::new`].
    pub fn new(
        storage: &'s mut [PoolNode],
        start: u64,
        length: u64,
        chunk_size: u64,
    ) -> Result<Self, StorageError> {
        let geometry = PoolGeometry::new(start, length, chunk_size);
        let required = geometry.node_count();
        if storage.len() < required {
            return Err(StorageError::TooSmall {
                provided: storage.len(),
                required,
            });
        }

        let nodes = &mut storage[..required];
        nodes.fill(PoolNode::new());

        debug!(
            "static memory pool 0x{start:016X} (+0x{length:X}), chunk 0x{chunk_size:X}, {required} nodes"
        );
        Ok(Self { geometry, nodes })
    }

    #[inline]
    #[must_use]
    pub const fn geometry(&self) -> &PoolGeometry {
        &self.geometry
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        self.geometry.contains(address)
    }

    /// Allocate a block of at least `size` bytes; `None` if nothing fits.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let address = super::allocate(&mut *self.nodes, &self.geometry, size);
        trace!("static memory pool allocate 0x{size:X} => {address:X?}");
        address
    }

    /// Release the allocation containing `address`.
    ///
    /// # Errors
    /// [`RegionError`] if `address` is outside the pool or not allocated.
    pub fn free(&mut self, address: u64) -> Result<(), RegionError> {
        trace!("static memory pool free 0x{address:016X}");
        super::free(&mut *self.nodes, &self.geometry, address)
    }

    /// Bytes not covered by any allocation.
    #[must_use]
    pub fn available(&self) -> u64 {
        super::available(&*self.nodes, &self.geometry)
    }
}

impl NodeStore for [PoolNode] {
    #[inline]
    fn node(&self, index: usize) -> PoolNode {
        self[index]
    }

    #[inline]
    fn node_mut(&mut self, index: usize) -> &mut PoolNode {
        &mut self[index]
    }

    #[inline]
    fn children(&self, index: usize) -> Option<(usize, usize)> {
        let right = 2 * index + 2;
        (right < self.len()).then_some((right, right - 1))
    }

    fn materialize_children(&mut self, index: usize) -> Result<(usize, usize), StorageError> {
        self.children(index).ok_or(StorageError::TooSmall {
            provided: self.len(),
            required: 2 * index + 3,
        })
    }
}

impl RegionAllocator for StaticMemoryPool<'_> {
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
