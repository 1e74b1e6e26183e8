//! Fibonacci buddy allocator
//!
//! Blocks come in the 64 classes of [`crate::core::size_class`]. A request is
//! served from the smallest non-empty free list whose blocks are large
//! enough, splitting the block down until no smaller sub-block would hold
//! the request. Sibling fragments go back onto their own free lists.
//!
//! ```text
//! class 8 (440 B) at 0
//!   ├─ low:  class 7 (272 B) at 0
//!   └─ high: class 6 (168 B) at 272
//! ```
//!
//! When no list can serve a request the backing grows by one class: from
//! `size_of(c)` to `size_of(c + 1)` bytes, appending exactly one free block
//! of class `c - 1`. Existing blocks never move.
//!
//! Freed blocks are pushed back onto their list as they are. Adjacent free
//! buddies are not coalesced.

use crate::core::allocator::{Backing, FreeLists};
use crate::core::error::{Result, StoreError};
use crate::core::loc::Loc;
use crate::core::size_class::{
    class_for, format_size, max_block_size, size_of, MAX_SIZE_CLASS, NUM_SIZE_CLASSES,
};
use tracing::{debug, info};

/// Smallest data size class a store may start from
///
/// Growth from class `c` appends a class `c - 1` block, so `c` must be at
/// least 1; class 2 is the smallest file that holds a splittable block.
pub const MIN_DATA_SIZE_CLASS: usize = 2;

/// Buddy allocator state: free-list heads and the current backing size class
#[derive(Debug, Clone)]
pub struct BuddyAllocator {
    lists: FreeLists,
    size_class: usize,
    max_len: u64,
}

impl BuddyAllocator {
    /// Rebuild an allocator from persisted state
    ///
    /// `size_class` is the class of the whole backing, whose length must
    /// already be `size_of(size_class)`.
    pub fn new(lists: FreeLists, size_class: usize, max_len: u64) -> Result<Self> {
        if !(MIN_DATA_SIZE_CLASS..NUM_SIZE_CLASSES).contains(&size_class) {
            return Err(StoreError::Config(format!(
                "data size class {} outside {}..{}",
                size_class, MIN_DATA_SIZE_CLASS, NUM_SIZE_CLASSES
            )));
        }
        Ok(BuddyAllocator {
            lists,
            size_class,
            max_len,
        })
    }

    /// Discard every block and start over with one free block of `class`
    pub fn reset<B: Backing + ?Sized>(&mut self, backing: &mut B, class: usize) -> Result<()> {
        if !(MIN_DATA_SIZE_CLASS..NUM_SIZE_CLASSES).contains(&class) {
            return Err(StoreError::Config(format!(
                "data size class {} outside {}..{}",
                class, MIN_DATA_SIZE_CLASS, NUM_SIZE_CLASSES
            )));
        }
        let len = size_of(class);
        if len > self.max_len {
            return Err(StoreError::OutOfSpace {
                requested: len,
                limit: self.max_len,
            });
        }

        backing.resize_to(len)?;
        self.size_class = class;
        backing.record_size_class(class)?;
        self.lists.clear(backing)?;
        self.lists.push(backing, Loc::new(class, 0))
    }

    /// Free-list heads, for persisting into the index header
    pub fn free_lists(&self) -> &FreeLists {
        &self.lists
    }

    /// Size class of the whole backing
    pub fn size_class(&self) -> usize {
        self.size_class
    }

    /// Expected backing length
    pub fn data_len(&self) -> u64 {
        size_of(self.size_class)
    }

    pub fn max_len(&self) -> u64 {
        self.max_len
    }

    /// Allocate a block of at least `requested` bytes
    pub fn alloc<B: Backing + ?Sized>(&mut self, backing: &mut B, requested: u64) -> Result<Loc> {
        let min_class = class_for(requested).ok_or(StoreError::AllocationTooLarge {
            requested,
            max: max_block_size(),
        })?;

        for class in min_class..NUM_SIZE_CLASSES {
            if let Some(block) = self.lists.pop(backing, class)? {
                let loc = self.alloc_from(backing, block, requested)?;
                debug!(requested, %loc, "Allocated block");
                return Ok(loc);
            }
        }

        loop {
            let block = self.grow(backing)?;
            if block.block_bytes() >= requested {
                let loc = self.alloc_from(backing, block, requested)?;
                debug!(requested, %loc, "Allocated block after growth");
                return Ok(loc);
            }
            self.lists.push(backing, block)?;
        }
    }

    /// Split `block` down to the smallest sub-block that holds `requested`
    ///
    /// `block` must already be off its free list.
    fn alloc_from<B: Backing + ?Sized>(
        &mut self,
        backing: &mut B,
        mut block: Loc,
        requested: u64,
    ) -> Result<Loc> {
        while let Some((low, high)) = block.split() {
            // Prefer the smaller upper block. Halves of a class 1 block are
            // the same size; take the lower one.
            let (keep, spare) = if high.block_bytes() >= requested
                && high.size_class() < low.size_class()
            {
                (high, low)
            } else if low.block_bytes() >= requested {
                (low, high)
            } else {
                break;
            };
            self.lists.push(backing, spare)?;
            block = keep;
        }
        Ok(block)
    }

    /// Grow the backing by one size class and return the appended block
    fn grow<B: Backing + ?Sized>(&mut self, backing: &mut B) -> Result<Loc> {
        let old_class = self.size_class;
        let old_len = size_of(old_class);

        if old_class >= MAX_SIZE_CLASS {
            return Err(StoreError::OutOfSpace {
                requested: old_len.saturating_add(size_of(old_class - 1)),
                limit: old_len,
            });
        }

        let new_len = size_of(old_class + 1);
        if new_len > self.max_len {
            return Err(StoreError::OutOfSpace {
                requested: new_len,
                limit: self.max_len,
            });
        }

        info!(
            from = %format_size(old_len),
            to = %format_size(new_len),
            "Growing data file"
        );
        backing.resize_to(new_len)?;
        self.size_class = old_class + 1;
        backing.record_size_class(self.size_class)?;

        // size_of(c + 1) - size_of(c) == size_of(c - 1)
        Ok(Loc::new(old_class - 1, old_len))
    }

    /// Return a block to its free list
    pub fn free<B: Backing + ?Sized>(&mut self, backing: &mut B, loc: Loc) -> Result<()> {
        self.lists.push(backing, loc)?;
        debug!(%loc, "Freed block");
        Ok(())
    }

    /// Number of blocks on each free list
    pub fn free_list_lengths<B: Backing + ?Sized>(
        &self,
        backing: &B,
    ) -> Result<[u64; NUM_SIZE_CLASSES]> {
        let mut lengths = [0u64; NUM_SIZE_CLASSES];
        for (class, length) in lengths.iter_mut().enumerate() {
            for loc in self.lists.iter(backing, class) {
                loc?;
                *length += 1;
            }
        }
        Ok(lengths)
    }

    /// Total bytes held by all free lists
    pub fn count_free_bytes<B: Backing + ?Sized>(&self, backing: &B) -> Result<u64> {
        let lengths = self.free_list_lengths(backing)?;
        Ok(lengths
            .iter()
            .enumerate()
            .map(|(class, &n)| size_of(class) * n)
            .sum())
    }

    /// Zero every free block except its link
    ///
    /// Class 0 blocks are skipped: all 8 of their bytes are the link.
    pub fn zero_free_memory<B: Backing + ?Sized>(&self, backing: &mut B) -> Result<()> {
        for class in 1..NUM_SIZE_CLASSES {
            let blocks = self
                .lists
                .iter(&*backing, class)
                .collect::<Result<Vec<Loc>>>()?;
            for loc in blocks {
                backing.fill(loc.offset() + 8, loc.block_bytes() - 8, 0)?;
            }
        }
        Ok(())
    }
}
