//! Fibonacci size classes
//!
//! Block sizes follow a Fibonacci series scaled by 8 bytes:
//!
//! ```text
//! class:  0   1   2   3   4    5    6    7    8    9    10 ...
//! bytes:  8  16  24  40  64  104  168  272  440  712  1152 ...
//! ```
//!
//! Every size is the sum of the two sizes below it, so a block of class `s`
//! splits exactly into blocks of class `s-1` and `s-2`, and a file of
//! `size_of(s)` bytes grows to `size_of(s+1)` by appending one block of class
//! `s-1`. All sizes are multiples of 8, which keeps every block boundary
//! aligned for the 8-byte free-list links.

/// Number of size classes
pub const NUM_SIZE_CLASSES: usize = 64;

/// Largest class index
pub const MAX_SIZE_CLASS: usize = NUM_SIZE_CLASSES - 1;

const fn build_table() -> [u64; NUM_SIZE_CLASSES] {
    let mut table = [0u64; NUM_SIZE_CLASSES];
    table[0] = 8;
    table[1] = 16;
    let mut i = 2;
    while i < NUM_SIZE_CLASSES {
        table[i] = table[i - 1] + table[i - 2];
        i += 1;
    }
    table
}

/// Byte size of every class, indexed by class
pub const SIZE_CLASSES: [u64; NUM_SIZE_CLASSES] = build_table();

/// Byte size of a size class
///
/// Panics if `class >= NUM_SIZE_CLASSES`; callers validate class indices
/// read from disk before getting here.
#[inline]
pub const fn size_of(class: usize) -> u64 {
    SIZE_CLASSES[class]
}

/// Largest allocation the table can represent
#[inline]
pub const fn max_block_size() -> u64 {
    SIZE_CLASSES[MAX_SIZE_CLASS]
}

/// Smallest class whose blocks hold `bytes`, or `None` if no class does
pub fn class_for(bytes: u64) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&size| size >= bytes)
}

/// Render a byte count for logs, e.g. `440 B`, `1.1 kB`, `298.2 MB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
