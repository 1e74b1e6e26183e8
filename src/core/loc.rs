//! Block locations
//!
//! A [`Loc`] names one block of the data file: its size class and its byte
//! offset. On disk a location is a single little-endian `u64`:
//!
//! ```text
//!  63   62..56      55 .. 0
//! +---+--------+----------------+
//! | 1 | class  |  byte offset   |
//! +---+--------+----------------+
//! ```
//!
//! The top bit is always set for a real block, so the raw value `0` is free
//! to act as the null location (free-list terminator, unbound handle slot),
//! including for the 8-byte block at offset 0.

use crate::core::size_class::{format_size, size_of, NUM_SIZE_CLASSES};
use std::fmt;

const CLASS_SHIFT: u32 = 56;
const TAG_BIT: u64 = 1 << 63;
const CLASS_MASK: u64 = 0x7F;

/// Mask selecting the offset bits of a raw location
pub const OFFSET_MASK: u64 = (1 << CLASS_SHIFT) - 1;

/// Raw encoding of the null location
pub const NULL_LOC: u64 = 0;

/// A block in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Loc {
    class: u8,
    offset: u64,
}

impl Loc {
    /// Create a location
    ///
    /// Panics if `class` is not a valid size class or `offset` does not fit
    /// in 56 bits. Both come from allocator arithmetic, never from user input.
    pub fn new(class: usize, offset: u64) -> Self {
        assert!(class < NUM_SIZE_CLASSES, "size class {} out of range", class);
        assert!(offset <= OFFSET_MASK, "offset {} exceeds 56 bits", offset);
        Loc {
            class: class as u8,
            offset,
        }
    }

    /// Decode a raw location, `None` for the null location or a malformed value
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw & TAG_BIT == 0 {
            return None;
        }
        let class = ((raw >> CLASS_SHIFT) & CLASS_MASK) as usize;
        if class >= NUM_SIZE_CLASSES {
            return None;
        }
        Some(Loc {
            class: class as u8,
            offset: raw & OFFSET_MASK,
        })
    }

    /// Encode for storage in a free-list link or index slot
    pub fn raw(self) -> u64 {
        TAG_BIT | ((self.class as u64) << CLASS_SHIFT) | self.offset
    }

    pub fn size_class(self) -> usize {
        self.class as usize
    }

    pub fn offset(self) -> u64 {
        self.offset
    }

    /// Size of the block in bytes
    pub fn block_bytes(self) -> u64 {
        size_of(self.size_class())
    }

    /// One past the last byte of the block
    pub fn end(self) -> u64 {
        self.offset + self.block_bytes()
    }

    /// Whether the two blocks share any byte
    pub fn overlaps(self, other: Loc) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Split into the lower and upper sub-blocks
    ///
    /// A class `s` block splits into class `s-1` (low) and class `s-2`
    /// (high); the lower block is always the larger one. Class 1 splits into
    /// two class 0 halves. Returns `None` for class 0.
    pub fn split(self) -> Option<(Loc, Loc)> {
        let class = self.size_class();
        match class {
            0 => None,
            1 => Some((
                Loc::new(0, self.offset),
                Loc::new(0, self.offset + size_of(0)),
            )),
            _ => Some((
                Loc::new(class - 1, self.offset),
                Loc::new(class - 2, self.offset + size_of(class - 1)),
            )),
        }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", format_size(self.block_bytes()), self.offset)
    }
}
