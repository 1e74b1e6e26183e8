//! Block allocation for the data file
//!
//! The allocator is a Fibonacci buddy allocator:
//! - [`freelist`] - 64 intrusive free lists, one per size class, with the
//!   links stored in the first 8 bytes of each free block
//! - [`buddy`] - allocation by splitting, growth by appending whole classes
//!
//! The allocator never owns the bytes it manages. Every operation borrows a
//! [`Backing`] for the duration of the call, which is the mapped data file in
//! a store and a plain `Vec<u8>` in tests. Every head and size class change
//! is reported to the backing as it happens, so a store can keep its index
//! header current without a separate save step.

pub mod buddy;
pub mod freelist;

pub use buddy::BuddyAllocator;
pub use freelist::{FreeListIter, FreeLists};

use crate::core::error::{Result, StoreError};
use crate::core::region::MappedRegion;

/// Byte storage managed by the allocator
///
/// Offsets are absolute byte offsets from the start of the backing.
pub trait Backing {
    /// Current length in bytes
    fn len(&self) -> u64;

    /// Set the length to exactly `new_len` bytes
    ///
    /// Bytes below `min(len, new_len)` keep their contents.
    fn resize_to(&mut self, new_len: u64) -> Result<()>;

    /// Read the 8-byte free-list link at `offset`
    fn read_link(&self, offset: u64) -> Result<u64>;

    /// Write the 8-byte free-list link at `offset`
    fn write_link(&mut self, offset: u64, raw: u64) -> Result<()>;

    /// Set `len` bytes starting at `offset` to `byte`
    fn fill(&mut self, offset: u64, len: u64, byte: u8) -> Result<()>;

    /// Called after the head of the `class` free list changes to `raw`
    ///
    /// Backings whose allocator state must survive the process write it
    /// through here.
    fn record_free_head(&mut self, _class: usize, _raw: u64) -> Result<()> {
        Ok(())
    }

    /// Called after the backing has been resized to `size_of(class)`
    fn record_size_class(&mut self, _class: usize) -> Result<()> {
        Ok(())
    }
}

impl Backing for MappedRegion {
    fn len(&self) -> u64 {
        MappedRegion::len(self)
    }

    fn resize_to(&mut self, new_len: u64) -> Result<()> {
        self.resize(new_len)
    }

    fn read_link(&self, offset: u64) -> Result<u64> {
        self.read_u64(offset)
    }

    fn write_link(&mut self, offset: u64, raw: u64) -> Result<()> {
        self.write_u64(offset, raw)
    }

    fn fill(&mut self, offset: u64, len: u64, byte: u8) -> Result<()> {
        self.bytes_mut(offset, len)?.fill(byte);
        Ok(())
    }
}

impl Backing for Vec<u8> {
    fn len(&self) -> u64 {
        Vec::len(self) as u64
    }

    fn resize_to(&mut self, new_len: u64) -> Result<()> {
        let new_len = usize::try_from(new_len).map_err(|_| StoreError::OutOfSpace {
            requested: new_len,
            limit: usize::MAX as u64,
        })?;
        self.resize(new_len, 0);
        Ok(())
    }

    fn read_link(&self, offset: u64) -> Result<u64> {
        let range = vec_range(self, offset, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&self[range]);
        Ok(u64::from_le_bytes(word))
    }

    fn write_link(&mut self, offset: u64, raw: u64) -> Result<()> {
        let range = vec_range(self, offset, 8)?;
        self[range].copy_from_slice(&raw.to_le_bytes());
        Ok(())
    }

    fn fill(&mut self, offset: u64, len: u64, byte: u8) -> Result<()> {
        let range = vec_range(self, offset, len)?;
        self[range].fill(byte);
        Ok(())
    }
}

fn vec_range(bytes: &[u8], offset: u64, len: u64) -> Result<std::ops::Range<usize>> {
    let size = bytes.len() as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset as usize..end as usize),
        _ => Err(StoreError::OutOfBounds { offset, len, size }),
    }
}
