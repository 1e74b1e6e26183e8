//! Intrusive free lists
//!
//! Each size class has a singly linked list of free blocks. The list heads
//! are the only out-of-band state; each link is the raw [`Loc`] of the next
//! free block of the same class, stored in the first 8 bytes of the block
//! itself (`0` terminates the list). Every read or write of an embedded link
//! goes through this module, and every link read back is checked to be a
//! well-formed block of the expected class inside the backing.

use crate::core::allocator::Backing;
use crate::core::error::{Result, StoreError};
use crate::core::loc::{Loc, NULL_LOC};
use crate::core::size_class::{size_of, NUM_SIZE_CLASSES};

/// Free-list heads, one raw location per size class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeLists {
    heads: [u64; NUM_SIZE_CLASSES],
}

impl FreeLists {
    /// All lists empty
    pub fn new() -> Self {
        FreeLists {
            heads: [NULL_LOC; NUM_SIZE_CLASSES],
        }
    }

    /// Restore heads read from the index header
    pub fn from_raw(heads: [u64; NUM_SIZE_CLASSES]) -> Self {
        FreeLists { heads }
    }

    /// Heads in their on-disk encoding
    pub fn raw(&self) -> &[u64; NUM_SIZE_CLASSES] {
        &self.heads
    }

    pub fn is_empty(&self, class: usize) -> bool {
        self.heads[class] == NULL_LOC
    }

    /// Empty every list
    pub fn clear<B: Backing + ?Sized>(&mut self, backing: &mut B) -> Result<()> {
        self.heads = [NULL_LOC; NUM_SIZE_CLASSES];
        for class in 0..NUM_SIZE_CLASSES {
            backing.record_free_head(class, NULL_LOC)?;
        }
        Ok(())
    }

    /// Push a block onto the list of its size class
    pub fn push<B: Backing + ?Sized>(&mut self, backing: &mut B, loc: Loc) -> Result<()> {
        if loc.end() > backing.len() {
            return Err(StoreError::InvalidLocation(loc.raw()));
        }
        let class = loc.size_class();
        backing.write_link(loc.offset(), self.heads[class])?;
        self.heads[class] = loc.raw();
        backing.record_free_head(class, loc.raw())
    }

    /// Pop the head of a class list, `None` if the list is empty
    pub fn pop<B: Backing + ?Sized>(&mut self, backing: &mut B, class: usize) -> Result<Option<Loc>> {
        let head = match decode_link(self.heads[class], class, backing.len())? {
            Some(loc) => loc,
            None => return Ok(None),
        };
        let next = backing.read_link(head.offset())?;
        decode_link(next, class, backing.len())?;
        self.heads[class] = next;
        backing.record_free_head(class, next)?;
        Ok(Some(head))
    }

    /// Walk one class list without modifying it
    pub fn iter<'a, B: Backing + ?Sized>(&self, backing: &'a B, class: usize) -> FreeListIter<'a, B> {
        FreeListIter {
            backing,
            class,
            next: self.heads[class],
            // A list longer than the number of blocks that fit is a cycle
            remaining: backing.len() / size_of(class) + 1,
        }
    }
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the blocks of one free list
pub struct FreeListIter<'a, B: ?Sized> {
    backing: &'a B,
    class: usize,
    next: u64,
    remaining: u64,
}

impl<'a, B: Backing + ?Sized> Iterator for FreeListIter<'a, B> {
    type Item = Result<Loc>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.next;
        let loc = match decode_link(raw, self.class, self.backing.len()) {
            Ok(Some(loc)) => loc,
            Ok(None) => return None,
            Err(e) => {
                self.next = NULL_LOC;
                return Some(Err(e));
            }
        };

        if self.remaining == 0 {
            self.next = NULL_LOC;
            return Some(Err(StoreError::InvalidLocation(raw)));
        }
        self.remaining -= 1;

        match self.backing.read_link(loc.offset()) {
            Ok(next) => self.next = next,
            Err(e) => {
                self.next = NULL_LOC;
                return Some(Err(e));
            }
        }
        Some(Ok(loc))
    }
}

/// Decode a stored link, checking class and bounds
fn decode_link(raw: u64, class: usize, backing_len: u64) -> Result<Option<Loc>> {
    if raw == NULL_LOC {
        return Ok(None);
    }
    match Loc::from_raw(raw) {
        Some(loc) if loc.size_class() == class && loc.end() <= backing_len => Ok(Some(loc)),
        _ => Err(StoreError::InvalidLocation(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_lifo() {
        let mut backing = vec![0u8; 64];
        let mut lists = FreeLists::new();

        let a = Loc::new(1, 0);
        let b = Loc::new(1, 16);
        lists.push(&mut backing, a).unwrap();
        lists.push(&mut backing, b).unwrap();

        // Link stored inside the block
        assert_eq!(backing.read_link(16).unwrap(), a.raw());
        assert_eq!(backing.read_link(0).unwrap(), NULL_LOC);

        assert_eq!(lists.pop(&mut backing, 1).unwrap(), Some(b));
        assert_eq!(lists.pop(&mut backing, 1).unwrap(), Some(a));
        assert_eq!(lists.pop(&mut backing, 1).unwrap(), None);
        assert!(lists.is_empty(1));
    }

    #[test]
    fn test_class_zero_at_offset_zero() {
        let mut backing = vec![0u8; 16];
        let mut lists = FreeLists::new();

        lists.push(&mut backing, Loc::new(0, 0)).unwrap();
        assert!(!lists.is_empty(0));
        assert_eq!(lists.pop(&mut backing, 0).unwrap(), Some(Loc::new(0, 0)));
    }

    #[test]
    fn test_iter_walks_list() {
        let mut backing = vec![0u8; 128];
        let mut lists = FreeLists::new();
        for offset in [0u64, 40, 80] {
            lists.push(&mut backing, Loc::new(3, offset)).unwrap();
        }

        let offsets: Vec<u64> = lists
            .iter(&backing, 3)
            .map(|loc| loc.unwrap().offset())
            .collect();
        assert_eq!(offsets, vec![80, 40, 0]);
        assert_eq!(lists.iter(&backing, 4).count(), 0);
    }

    #[test]
    fn test_push_outside_backing_rejected() {
        let mut backing = vec![0u8; 16];
        let mut lists = FreeLists::new();
        let result = lists.push(&mut backing, Loc::new(1, 8));
        assert!(matches!(result, Err(StoreError::InvalidLocation(_))));
        assert!(lists.is_empty(1));
    }

    #[test]
    fn test_corrupt_link_detected() {
        let mut backing = vec![0u8; 64];
        let mut lists = FreeLists::new();
        lists.push(&mut backing, Loc::new(1, 0)).unwrap();

        // Link claims a block of the wrong class
        backing.write_link(0, Loc::new(2, 16).raw()).unwrap();

        let result = lists.pop(&mut backing, 1);
        assert!(matches!(result, Err(StoreError::InvalidLocation(_))));
        let walked: Vec<_> = lists.iter(&backing, 1).collect();
        assert_eq!(walked.len(), 2);
        assert!(walked[1].is_err());
    }

    #[test]
    fn test_cycle_detected() {
        let mut backing = vec![0u8; 32];
        let mut lists = FreeLists::new();
        lists.push(&mut backing, Loc::new(1, 0)).unwrap();

        // Block links to itself
        backing.write_link(0, Loc::new(1, 0).raw()).unwrap();

        let results: Vec<_> = lists.iter(&backing, 1).collect();
        assert!(results.last().unwrap().is_err());
    }

    /// Vec backing that remembers every reported head
    #[derive(Default)]
    struct Recording {
        bytes: Vec<u8>,
        heads: Vec<(usize, u64)>,
    }

    impl Backing for Recording {
        fn len(&self) -> u64 {
            Backing::len(&self.bytes)
        }
        fn resize_to(&mut self, new_len: u64) -> Result<()> {
            self.bytes.resize_to(new_len)
        }
        fn read_link(&self, offset: u64) -> Result<u64> {
            self.bytes.read_link(offset)
        }
        fn write_link(&mut self, offset: u64, raw: u64) -> Result<()> {
            self.bytes.write_link(offset, raw)
        }
        fn fill(&mut self, offset: u64, len: u64, byte: u8) -> Result<()> {
            self.bytes.fill(offset, len, byte)
        }
        fn record_free_head(&mut self, class: usize, raw: u64) -> Result<()> {
            self.heads.push((class, raw));
            Ok(())
        }
    }

    #[test]
    fn test_head_changes_reported() {
        let mut backing = Recording {
            bytes: vec![0u8; 64],
            ..Default::default()
        };
        let mut lists = FreeLists::new();

        let a = Loc::new(1, 0);
        let b = Loc::new(1, 16);
        lists.push(&mut backing, a).unwrap();
        lists.push(&mut backing, b).unwrap();
        lists.pop(&mut backing, 1).unwrap();
        assert_eq!(
            backing.heads,
            vec![(1, a.raw()), (1, b.raw()), (1, a.raw())]
        );

        // Empty list pops report nothing
        backing.heads.clear();
        lists.pop(&mut backing, 5).unwrap();
        assert!(backing.heads.is_empty());

        lists.clear(&mut backing).unwrap();
        assert_eq!(backing.heads.len(), NUM_SIZE_CLASSES);
        assert!(backing.heads.iter().all(|&(_, raw)| raw == NULL_LOC));
        assert!(lists.is_empty(1));
    }
}
