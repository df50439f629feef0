//! # Memory Stack
//!
//! A LIFO pool of free physical-page extents. Each entry is a [`Run`] of
//! `block_count` consecutive blocks starting at `base`:
//!
//! ```text
//!            ┌────────────────────────────┐
//!  index ──► │         (free slot)        │
//!            ├────────────────────────────┤
//!  top   ──► │ base 0x0030_0000, 16 blocks│ ◄── pops take the tail of this run
//!            ├────────────────────────────┤
//!            │ base 0x0010_0000, 64 blocks│
//!            └────────────────────────────┘
//! ```
//!
//! Pushing a run that touches the top entry extends it instead of using a new
//! slot, which keeps the stack short when pages are handed back in address
//! order (the common case when boot-time memory is reclaimed).
//!
//! The stack is not synchronized; the physical memory manager owning it holds
//! a coarser lock around each sequence of calls.

use crate::error::{PushError, StorageError};
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// A run of `block_count` consecutive blocks starting at `base`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Run {
    pub base: u64,
    pub block_count: usize,
}

impl Run {
    /// First address past the run, or `None` if it would wrap.
    #[inline]
    #[must_use]
    pub const fn end(&self, block_size: u64) -> Option<u64> {
        match (self.block_count as u64).checked_mul(block_size) {
            Some(bytes) => self.base.checked_add(bytes),
            None => None,
        }
    }

    /// Address of the run's last block, or `None` if it lies past the end of
    /// the address space.
    #[inline]
    #[must_use]
    pub const fn last(&self, block_size: u64) -> Option<u64> {
        if self.block_count == 0 {
            return None;
        }
        match ((self.block_count - 1) as u64).checked_mul(block_size) {
            Some(offset) => self.base.checked_add(offset),
            None => None,
        }
    }
}

/// Outcome of [`MemoryStack::pop`].
#[must_use]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Pop {
    /// Every requested block was returned.
    Complete(usize),
    /// The stack ran dry; only this many leading slots were filled.
    Partial(usize),
}

impl Pop {
    /// Number of output slots written.
    #[inline]
    #[must_use]
    pub const fn filled(self) -> usize {
        match self {
            Self::Complete(n) | Self::Partial(n) => n,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// The backing storage moved while growing.
///
/// Callers that mapped the storage somewhere (for example an identity mapping
/// during boot) use this to fix the mapping up.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StorageRelocation {
    /// Storage address before the first unacknowledged move.
    pub from: u64,
    /// Current storage address.
    pub to: u64,
    /// Current storage size in bytes.
    pub data_size: usize,
}

pub struct MemoryStack {
    items: Vec<Run>,
    /// Entries the storage is sized for; doubles on growth.
    capacity: usize,
    block_size: u64,
    relocation: Option<StorageRelocation>,
}

impl MemoryStack {
    /// Create an empty stack of `block_size` units with `data_size` bytes of
    /// entry storage (at least one entry).
    ///
    /// # Errors
    /// [`StorageError::OutOfMemory`] if the storage cannot be reserved.
    ///
    /// # Panics
    /// If `block_size` is zero.
    pub fn new(block_size: u64, data_size: usize) -> Result<Self, StorageError> {
        assert!(block_size > 0, "block size must be non-zero");
        let capacity = (data_size / size_of::<Run>()).max(1);

        let mut items = Vec::new();
        items
            .try_reserve_exact(capacity)
            .map_err(|_| StorageError::OutOfMemory {
                bytes: capacity * size_of::<Run>(),
            })?;

        debug!("memory stack: block size 0x{block_size:X}, {capacity} entries");
        Ok(Self {
            items,
            capacity,
            block_size,
            relocation: None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of entries (runs) on the stack.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the entry storage in bytes.
    #[inline]
    #[must_use]
    pub const fn data_size(&self) -> usize {
        self.capacity * size_of::<Run>()
    }

    /// Entries, bottom of the stack first.
    #[inline]
    #[must_use]
    pub fn runs(&self) -> &[Run] {
        &self.items
    }

    /// Total number of blocks held by all entries.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.items.iter().map(|run| run.block_count).sum()
    }

    /// Current address of the entry storage.
    #[inline]
    #[must_use]
    pub fn storage_address(&self) -> u64 {
        self.items.as_ptr().addr() as u64
    }

    /// Push `block_count` blocks starting at `address`.
    ///
    /// A run adjacent to the top entry (directly above or directly below it)
    /// is merged into that entry.
    ///
    /// # Errors
    /// - [`PushError::Wraps`] if the run extends past the end of the address
    ///   space.
    /// - [`PushError::Storage`] if a new entry is needed and the storage
    ///   cannot grow.
    ///
    /// The stack is unchanged on error.
    pub fn push(&mut self, address: u64, block_count: usize) -> Result<(), PushError> {
        if block_count == 0 {
            return Ok(());
        }

        let run = Run {
            base: address,
            block_count,
        };
        if run.last(self.block_size).is_none() {
            warn!("memory stack: rejecting run of {block_count} blocks at 0x{address:016X}");
            return Err(PushError::Wraps {
                address,
                block_count,
            });
        }

        if let Some(top) = self.items.last_mut()
            && let Some(merged) = top.block_count.checked_add(block_count)
        {
            if top.end(self.block_size) == Some(address) {
                top.block_count = merged;
                return Ok(());
            }
            if run.end(self.block_size) == Some(top.base) {
                top.base = address;
                top.block_count = merged;
                return Ok(());
            }
        }

        if self.items.len() == self.capacity {
            self.grow()?;
        }
        self.items.push(run);
        trace!(
            "memory stack push 0x{address:016X} ({block_count} blocks), {} entries",
            self.items.len()
        );
        Ok(())
    }

    /// Push single blocks, last address first.
    ///
    /// Callers pass addresses in descending order so consecutive pages merge
    /// into one entry.
    ///
    /// # Errors
    /// See [`push`](Self::push); blocks before the failing one stay pushed.
    pub fn push_multiple(&mut self, addresses: &[u64]) -> Result<(), PushError> {
        addresses
            .iter()
            .rev()
            .try_for_each(|&address| self.push(address, 1))
    }

    /// Pop up to `out.len()` blocks, writing one address per slot.
    ///
    /// Blocks are taken from the tail of the top entry first, in ascending
    /// address order within each entry. If the stack runs dry the remaining
    /// slots are left untouched and [`Pop::Partial`] reports how many were
    /// written.
    pub fn pop(&mut self, out: &mut [u64]) -> Pop {
        let block_size = self.block_size;
        let mut filled = 0;

        while filled < out.len() {
            let Some(top) = self.items.last_mut() else {
                break;
            };

            let take = top.block_count.min(out.len() - filled);
            let first = top.base + (top.block_count - take) as u64 * block_size;
            for (i, slot) in out[filled..filled + take].iter_mut().enumerate() {
                *slot = first + i as u64 * block_size;
            }

            top.block_count -= take;
            filled += take;
            if top.block_count == 0 {
                self.items.pop();
            }
        }

        trace!("memory stack pop {} => {filled}", out.len());
        if filled == out.len() {
            Pop::Complete(filled)
        } else {
            Pop::Partial(filled)
        }
    }

    /// Acknowledge storage moves caused by growth.
    ///
    /// Returns the pending relocation, if growth moved the storage since the
    /// last call, and clears it. Call this after any push that may have
    /// grown the stack when the storage address is published elsewhere.
    pub fn relocate(&mut self) -> Option<StorageRelocation> {
        self.relocation.take()
    }

    /// Double the entry storage.
    fn grow(&mut self) -> Result<(), StorageError> {
        let new_capacity = self.capacity * 2;
        let old_address = self.storage_address();

        self.items
            .try_reserve_exact(new_capacity - self.items.len())
            .map_err(|_| StorageError::OutOfMemory {
                bytes: new_capacity * size_of::<Run>(),
            })?;
        self.capacity = new_capacity;

        let new_address = self.storage_address();
        let data_size = self.data_size();
        if let Some(pending) = &mut self.relocation {
            pending.to = new_address;
            pending.data_size = data_size;
        } else if new_address != old_address {
            self.relocation = Some(StorageRelocation {
                from: old_address,
                to: new_address,
                data_size,
            });
        }

        debug!(
            "memory stack grew to {new_capacity} entries (0x{data_size:X} bytes) at 0x{new_address:016X}"
        );
        Ok(())
    }
}
