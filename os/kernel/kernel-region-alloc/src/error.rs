//! Error types shared by the region allocators.
//!
//! Exhaustion is not an error: `allocate` returns `None` and
//! [`MemoryStack::pop`](crate::memory_stack::MemoryStack::pop) reports a
//! partial fill. The enums below cover invalid caller input and backing
//! storage problems.

/// A free or query named an address the allocator does not hand out.
///
/// Both variants are caller bugs. The allocator logs a warning, leaves its
/// state untouched and keeps running.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("address 0x{address:016X} lies outside the managed range")]
    OutOfRange { address: u64 },
    #[error("address 0x{address:016X} is not currently allocated")]
    NotAllocated { address: u64 },
}

/// Backing storage for allocator metadata could not be provided.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("out of memory while reserving {bytes} bytes of allocator storage")]
    OutOfMemory { bytes: usize },
    #[error("storage holds {provided} nodes, {required} required")]
    TooSmall { provided: usize, required: usize },
}

/// A run could not be pushed onto a
/// [`MemoryStack`](crate::memory_stack::MemoryStack).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PushError {
    /// The run's last block lies past the end of the address space.
    #[error("run of {block_count} blocks at 0x{address:016X} wraps the address space")]
    Wraps { address: u64, block_count: usize },
    #[error(transparent)]
    Storage(#[from] StorageError),
}
