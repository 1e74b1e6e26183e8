//! Object index
//!
//! The index file maps object handles to block locations. It starts with an
//! [`IndexHeader`] holding the allocator state, followed by the location
//! table: one raw [`Loc`] per handle, `0` for a free slot. Slot 0 is never
//! used, so handles start at 1.
//!
//! ```text
//! ┌──────────────────────┐ 0
//! │ IndexHeader (2 KiB)  │
//! ├──────────────────────┤ 2048
//! │ slot 0 (unused)      │
//! │ slot 1 -> Loc        │
//! │ slot 2 -> 0 (free)   │
//! │ ...                  │
//! └──────────────────────┘ index file length
//! ```
//!
//! Free handles live on an in-memory stack rebuilt from the zero slots on
//! open. When the stack runs dry the index file doubles in length and the
//! new slots join the stack.

pub mod header;

pub use header::{IndexHeader, MAGIC, TABLE_OFFSET, VERSION};

use crate::core::error::{Result, StoreError};
use crate::core::loc::{Loc, NULL_LOC};
use crate::core::region::MappedRegion;
use crate::core::size_class::NUM_SIZE_CLASSES;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Smallest index file that holds the header and one usable slot
pub const MIN_INDEX_SIZE: u64 = TABLE_OFFSET + 16;

/// Stable handle of a stored object
///
/// Handles are positive; the raw value `0` never names an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Wrap a raw handle, `None` for 0
    pub fn new(raw: u32) -> Option<Self> {
        (raw != 0).then_some(ObjectId(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle table backed by the index file
pub struct ObjectIndex {
    region: MappedRegion,
    initial_len: u64,

    /// Free handles, lowest on top
    free_ids: Vec<u32>,

    /// Handles issued by `new_handle` but not yet bound to a location
    reserved: HashSet<u32>,

    live: u64,
}

impl ObjectIndex {
    /// Initialize a fresh index over `region`
    ///
    /// `data_size_class` is recorded in the header as the class of the
    /// (empty) data file.
    pub fn create(region: MappedRegion, initial_len: u64, data_size_class: usize) -> Result<Self> {
        let mut index = ObjectIndex {
            region,
            initial_len,
            free_ids: Vec::new(),
            reserved: HashSet::new(),
            live: 0,
        };
        index.reset(data_size_class)?;
        Ok(index)
    }

    /// Reinterpret an existing index file
    ///
    /// Validates the header and every bound slot, then rebuilds the free
    /// handle stack from the zero slots. The file is not written; see
    /// [`ObjectIndex::sync_object_count`].
    pub fn open(region: MappedRegion, initial_len: u64) -> Result<(Self, IndexHeader)> {
        let len = region.len();
        if len < MIN_INDEX_SIZE || (len - TABLE_OFFSET) % 8 != 0 {
            return Err(StoreError::CorruptIndex(format!(
                "index file length {} is not a valid table size",
                len
            )));
        }

        let header = IndexHeader::from_bytes(region.bytes(0, TABLE_OFFSET)?)?;

        let mut index = ObjectIndex {
            region,
            initial_len,
            free_ids: Vec::new(),
            reserved: HashSet::new(),
            live: 0,
        };

        for id in (1..=index.capacity()).rev() {
            let raw = index.region.read_u64(slot_offset(id))?;
            if raw == NULL_LOC {
                index.free_ids.push(id);
            } else if Loc::from_raw(raw).is_some() {
                index.live += 1;
            } else {
                return Err(StoreError::CorruptIndex(format!(
                    "slot {} holds malformed location {:#018x}",
                    id, raw
                )));
            }
        }

        if index.live != header.object_count {
            warn!(
                recorded = header.object_count,
                found = index.live,
                "Index object count out of date, using table scan"
            );
        }

        debug!(
            path = %index.region.path().display(),
            objects = index.live,
            capacity = index.capacity(),
            "Opened object index"
        );

        Ok((index, header))
    }

    /// Drop every handle and write a fresh header
    ///
    /// The index file shrinks back to its initial length.
    pub fn reset(&mut self, data_size_class: usize) -> Result<()> {
        self.region.resize(self.initial_len)?;
        let len = self.region.len();
        self.region.bytes_mut(0, len)?.fill(0);

        let header = IndexHeader::new(data_size_class);
        self.region
            .bytes_mut(0, TABLE_OFFSET)?
            .copy_from_slice(&header.to_bytes());

        self.reserved.clear();
        self.live = 0;
        self.free_ids = (1..=self.capacity()).rev().collect();

        info!(
            path = %self.region.path().display(),
            capacity = self.capacity(),
            "Reset object index"
        );
        Ok(())
    }

    /// Read the header as currently stored
    pub fn header(&self) -> Result<IndexHeader> {
        IndexHeader::from_bytes(self.region.bytes(0, TABLE_OFFSET)?)
    }

    /// Record the head of one free list in the header
    pub fn write_free_head(&mut self, class: usize, raw: u64) -> Result<()> {
        if class >= NUM_SIZE_CLASSES {
            return Err(StoreError::InvalidLocation(raw));
        }
        self.region.write_u64(header::free_head_offset(class), raw)
    }

    /// Record the data file size class in the header
    pub fn write_data_size_class(&mut self, class: usize) -> Result<()> {
        self.region
            .write_u64(header::size_class_offset(), class as u64)
    }

    /// Rewrite the header object count if it disagrees with the table
    pub fn sync_object_count(&mut self) -> Result<()> {
        if self.region.read_u64(header::object_count_offset())? != self.live {
            self.write_object_count()?;
        }
        Ok(())
    }

    /// Number of usable handle slots
    pub fn capacity(&self) -> u32 {
        let slots = (self.region.len() - TABLE_OFFSET) / 8 - 1;
        slots.min(u32::MAX as u64) as u32
    }

    /// Handles currently issued
    pub fn live_count(&self) -> u64 {
        self.live
    }

    /// Issue an unused handle, growing the table if none is free
    pub fn new_handle(&mut self) -> Result<ObjectId> {
        if self.free_ids.is_empty() {
            self.grow()?;
        }
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                return Err(StoreError::OutOfSpace {
                    requested: self.region.len(),
                    limit: self.region.max_len(),
                })
            }
        };

        self.reserved.insert(id);
        self.live += 1;
        self.write_object_count()?;
        Ok(ObjectId(id))
    }

    /// Release a handle, bound or reserved
    pub fn free_handle(&mut self, id: ObjectId) -> Result<()> {
        let offset = self.checked_slot(id)?;
        let raw = self.region.read_u64(offset)?;
        if raw == NULL_LOC && !self.reserved.remove(&id.0) {
            return Err(StoreError::InvalidHandle(id.0));
        }

        self.region.write_u64(offset, NULL_LOC)?;
        self.free_ids.push(id.0);
        self.live -= 1;
        self.write_object_count()
    }

    /// Take back a handle released by [`ObjectIndex::free_handle`] and bind
    /// it to `loc` again
    pub fn restore_handle(&mut self, id: ObjectId, loc: Loc) -> Result<()> {
        let offset = self.checked_slot(id)?;
        let pos = self
            .free_ids
            .iter()
            .rposition(|&free| free == id.0)
            .ok_or(StoreError::InvalidHandle(id.0))?;
        self.free_ids.remove(pos);

        self.region.write_u64(offset, loc.raw())?;
        self.live += 1;
        self.write_object_count()
    }

    /// Bind or rebind a handle to a block
    pub fn set_location(&mut self, id: ObjectId, loc: Loc) -> Result<()> {
        let offset = self.checked_slot(id)?;
        let raw = self.region.read_u64(offset)?;
        if raw == NULL_LOC && !self.reserved.remove(&id.0) {
            return Err(StoreError::InvalidHandle(id.0));
        }
        self.region.write_u64(offset, loc.raw())
    }

    /// Block currently bound to a handle
    pub fn location(&self, id: ObjectId) -> Result<Loc> {
        let offset = self.checked_slot(id)?;
        let raw = self.region.read_u64(offset)?;
        if raw == NULL_LOC {
            return Err(StoreError::InvalidHandle(id.0));
        }
        Loc::from_raw(raw).ok_or_else(|| {
            StoreError::CorruptIndex(format!(
                "slot {} holds malformed location {:#018x}",
                id.0, raw
            ))
        })
    }

    /// Every bound handle with its block, in handle order
    pub fn iter_live(&self) -> impl Iterator<Item = (ObjectId, Loc)> + '_ {
        (1..=self.capacity()).filter_map(move |id| {
            let raw = self.region.read_u64(slot_offset(id)).ok()?;
            Loc::from_raw(raw).map(|loc| (ObjectId(id), loc))
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.region.flush()
    }

    /// Whether the index has unflushed writes
    pub fn is_dirty(&self) -> bool {
        self.region.is_dirty()
    }

    /// Index file length in bytes
    pub fn file_len(&self) -> u64 {
        self.region.len()
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    fn checked_slot(&self, id: ObjectId) -> Result<u64> {
        if id.0 == 0 || id.0 > self.capacity() {
            return Err(StoreError::InvalidHandle(id.0));
        }
        Ok(slot_offset(id.0))
    }

    /// Double the index file and stack the new handles
    fn grow(&mut self) -> Result<()> {
        let old_capacity = self.capacity();
        let old_len = self.region.len();
        let new_len = old_len.checked_mul(2).ok_or(StoreError::OutOfSpace {
            requested: u64::MAX,
            limit: self.region.max_len(),
        })?;

        self.region.resize(new_len)?;
        let new_capacity = self.capacity();
        self.free_ids.extend((old_capacity + 1..=new_capacity).rev());

        info!(
            path = %self.region.path().display(),
            from = old_capacity,
            to = new_capacity,
            "Grew object table"
        );
        Ok(())
    }

    fn write_object_count(&mut self) -> Result<()> {
        self.region
            .write_u64(header::object_count_offset(), self.live)
    }
}

fn slot_offset(id: u32) -> u64 {
    TABLE_OFFSET + id as u64 * 8
}
