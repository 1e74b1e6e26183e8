//! File store facade
//!
//! A [`FileStore`] pairs two memory-mapped files under a common prefix:
//!
//! - `{prefix}index` - header with the allocator state, then the handle table
//! - `{prefix}data` - the blocks themselves
//!
//! Objects are addressed by [`ObjectId`] handles. The index maps each handle
//! to the [`Loc`] of its block, so a block can move (see
//! [`FileStore::resize_object`]) without the handle changing.
//!
//! Allocator state is written into the index header as it changes, so the
//! header matches the slot table at all times and a store whose process died
//! without flushing reloads consistently. [`FileStore::flush`] only syncs the
//! mapped pages to disk.

use crate::core::allocator::{Backing, BuddyAllocator, FreeLists};
use crate::core::config::StoreConfig;
use crate::core::error::{Result, StoreError};
use crate::core::index::{ObjectId, ObjectIndex};
use crate::core::loc::Loc;
use crate::core::region::MappedRegion;
use crate::core::size_class::{format_size, size_of, NUM_SIZE_CLASSES};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const INDEX_SUFFIX: &str = "index";
const DATA_SUFFIX: &str = "data";

/// Object store over an index file and a data file
pub struct FileStore {
    config: StoreConfig,
    index: ObjectIndex,
    data: MappedRegion,
    allocator: BuddyAllocator,
}

impl FileStore {
    /// Create an empty store, discarding anything already at `prefix`
    ///
    /// `prefix` is prepended verbatim to the file names, so `"/tmp/db-"`
    /// gives `/tmp/db-index` and `/tmp/db-data`.
    pub fn create<P: AsRef<Path>>(prefix: P, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let (index_path, data_path) = store_paths(prefix.as_ref());

        let index_region = MappedRegion::open_or_create(
            &index_path,
            config.index_initial_size,
            config.max_index_size,
        )?;
        let store = Self::fresh(config, index_region, &data_path)?;

        info!(
            index = %index_path.display(),
            data = %data_path.display(),
            "Created store"
        );
        Ok(store)
    }

    /// Open the store at `prefix`
    ///
    /// A missing or empty index file yields a fresh empty store. Otherwise
    /// the header is validated and the data file is mapped at the recorded
    /// size class. Neither file is modified unless every live object lies
    /// inside both the recorded size class and the data file on disk.
    pub fn load<P: AsRef<Path>>(prefix: P, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let (index_path, data_path) = store_paths(prefix.as_ref());

        let index_region = MappedRegion::open_or_create(
            &index_path,
            config.index_initial_size,
            config.max_index_size,
        )?;

        if index_region.was_empty() {
            info!(index = %index_path.display(), "Index file empty, initializing store");
            return Self::fresh(config, index_region, &data_path);
        }

        let (mut index, header) = ObjectIndex::open(index_region, config.index_initial_size)?;
        let class = header.size_class();
        let data_len = size_of(class);

        let file_len = match std::fs::metadata(&data_path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let usable = data_len.min(file_len);
        for (id, loc) in index.iter_live() {
            if loc.end() > usable {
                return Err(StoreError::CorruptIndex(format!(
                    "object {} at {} lies outside the {}-byte data file",
                    id, loc, usable
                )));
            }
        }

        let allocator = BuddyAllocator::new(
            FreeLists::from_raw(header.free_heads),
            class,
            config.max_data_size,
        )?;

        // Past this point only unused bytes are added or cut off
        if file_len != data_len {
            warn!(
                path = %data_path.display(),
                found = file_len,
                expected = data_len,
                "Data file length differs from index, resizing"
            );
        }
        let mut data = MappedRegion::open_or_create(&data_path, data_len, config.max_data_size)?;
        data.resize(data_len)?;
        index.sync_object_count()?;

        info!(
            index = %index_path.display(),
            data = %data_path.display(),
            objects = index.live_count(),
            data_size = %format_size(data_len),
            "Loaded store"
        );

        Ok(FileStore {
            config,
            index,
            data,
            allocator,
        })
    }

    fn fresh(config: StoreConfig, index_region: MappedRegion, data_path: &Path) -> Result<Self> {
        let class = config.initial_size_class;
        let data = MappedRegion::open_or_create(data_path, size_of(class), config.max_data_size)?;
        let index = ObjectIndex::create(index_region, config.index_initial_size, class)?;
        let allocator = BuddyAllocator::new(FreeLists::new(), class, config.max_data_size)?;

        let mut store = FileStore {
            config,
            index,
            data,
            allocator,
        };
        store.reset()?;
        Ok(store)
    }

    /// Discard every object and block
    ///
    /// Leaves an empty store with the data file at its initial size class.
    pub fn reset(&mut self) -> Result<()> {
        let class = self.config.initial_size_class;

        // Unbind every object before the data file shrinks under them
        self.index.reset(class)?;
        let (allocator, mut backing) = self.parts();
        allocator.reset(&mut backing, class)?;
        if self.config.zero_on_reset {
            let (allocator, mut backing) = self.parts();
            allocator.zero_free_memory(&mut backing)?;
        }

        info!(data_size = %format_size(size_of(class)), "Reset store");
        Ok(())
    }

    /// Allocate a block of at least `bytes` bytes
    pub fn alloc(&mut self, bytes: u64) -> Result<Loc> {
        let (allocator, mut backing) = self.parts();
        allocator.alloc(&mut backing, bytes)
    }

    /// Return a block to the allocator
    pub fn free(&mut self, loc: Loc) -> Result<()> {
        self.check_loc(loc)?;
        let (allocator, mut backing) = self.parts();
        allocator.free(&mut backing, loc)
    }

    /// Allocate a block and bind it to a new handle
    ///
    /// The handle is released again if the allocation fails.
    pub fn new_object(&mut self, bytes: u64) -> Result<ObjectId> {
        let id = self.index.new_handle()?;
        let (allocator, mut backing) = self.parts();
        match allocator.alloc(&mut backing, bytes) {
            Ok(loc) => {
                self.index.set_location(id, loc)?;
                Ok(id)
            }
            Err(e) => {
                self.index.free_handle(id)?;
                Err(e)
            }
        }
    }

    /// Release a handle
    ///
    /// The block stays allocated; free it with [`FileStore::free`].
    pub fn free_object(&mut self, id: ObjectId) -> Result<()> {
        self.index.free_handle(id)
    }

    /// Release a handle and its block
    ///
    /// If the block cannot be freed the handle stays bound to it.
    pub fn delete_object(&mut self, id: ObjectId) -> Result<()> {
        let loc = self.index.location(id)?;

        // A block is never bound and on a free list at the same time
        self.index.free_handle(id)?;
        let (allocator, mut backing) = self.parts();
        if let Err(e) = allocator.free(&mut backing, loc) {
            self.index.restore_handle(id, loc)?;
            return Err(e);
        }
        Ok(())
    }

    /// Make an object's block hold at least `bytes` bytes
    ///
    /// Moves the object to a new block only if the current one is too small,
    /// keeping its contents. The handle is unchanged either way.
    pub fn resize_object(&mut self, id: ObjectId, bytes: u64) -> Result<Loc> {
        let old = self.index.location(id)?;
        if old.block_bytes() >= bytes {
            return Ok(old);
        }

        let (allocator, mut backing) = self.parts();
        let new = allocator.alloc(&mut backing, bytes)?;
        let len = self.data.len();
        self.data.bytes_mut(0, len)?.copy_within(
            old.offset() as usize..old.end() as usize,
            new.offset() as usize,
        );
        self.index.set_location(id, new)?;

        let (allocator, mut backing) = self.parts();
        allocator.free(&mut backing, old)?;
        Ok(new)
    }

    /// Block currently bound to a handle
    pub fn location(&self, id: ObjectId) -> Result<Loc> {
        self.index.location(id)
    }

    /// Borrow a whole block
    pub fn get(&self, loc: Loc) -> Result<&[u8]> {
        self.check_loc(loc)?;
        self.data.bytes(loc.offset(), loc.block_bytes())
    }

    /// Mutably borrow a whole block
    pub fn get_mut(&mut self, loc: Loc) -> Result<&mut [u8]> {
        self.check_loc(loc)?;
        self.data.bytes_mut(loc.offset(), loc.block_bytes())
    }

    /// Borrow an object's block
    pub fn object(&self, id: ObjectId) -> Result<&[u8]> {
        let loc = self.index.location(id)?;
        self.get(loc)
    }

    /// Mutably borrow an object's block
    pub fn object_mut(&mut self, id: ObjectId) -> Result<&mut [u8]> {
        let loc = self.index.location(id)?;
        self.get_mut(loc)
    }

    /// Copy `bytes` to the start of an object's block
    pub fn write_object(&mut self, id: ObjectId, bytes: &[u8]) -> Result<()> {
        let block = self.object_mut(id)?;
        if bytes.len() > block.len() {
            return Err(StoreError::BlockTooSmall {
                len: bytes.len() as u64,
                capacity: block.len() as u64,
            });
        }
        block[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy out an object's whole block
    ///
    /// The store keeps no object lengths, so the result is the full block.
    pub fn read_object(&self, id: ObjectId) -> Result<Vec<u8>> {
        Ok(self.object(id)?.to_vec())
    }

    /// Every bound handle with its block, in handle order
    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, Loc)> + '_ {
        self.index.iter_live()
    }

    /// Sync both files to disk
    pub fn flush(&mut self) -> Result<()> {
        self.data.flush()?;
        self.index.flush()
    }

    /// Flush and close
    ///
    /// Dropping a store also flushes, but only logs failures.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Total bytes on the free lists
    pub fn count_free_bytes(&self) -> Result<u64> {
        self.allocator.count_free_bytes(&self.data)
    }

    /// Zero the contents of every free block
    pub fn zero_free_memory(&mut self) -> Result<()> {
        let (allocator, mut backing) = self.parts();
        allocator.zero_free_memory(&mut backing)
    }

    /// Data file length in bytes
    pub fn data_size(&self) -> u64 {
        self.data.len()
    }

    pub fn data_size_class(&self) -> usize {
        self.allocator.size_class()
    }

    /// Handles currently issued
    pub fn object_count(&self) -> u64 {
        self.index.live_count()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn index_path(&self) -> &Path {
        self.index.path()
    }

    pub fn data_path(&self) -> &Path {
        self.data.path()
    }

    /// Free-list and usage statistics
    pub fn stats(&self) -> Result<StoreStats> {
        let free_counts = self.allocator.free_list_lengths(&self.data)?;
        let free_bytes: u64 = free_counts
            .iter()
            .enumerate()
            .map(|(class, &n)| size_of(class) * n)
            .sum();
        let total_bytes = self.data.len();

        Ok(StoreStats {
            free_counts,
            total_bytes,
            free_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            object_count: self.index.live_count(),
            data_size_class: self.allocator.size_class(),
        })
    }

    /// Log free lists and usage
    pub fn log(&self) -> Result<()> {
        let stats = self.stats()?;
        for (class, &count) in stats.free_counts.iter().enumerate() {
            if count > 0 {
                info!(
                    class,
                    size = %format_size(size_of(class)),
                    count,
                    "Free list"
                );
            }
        }
        info!(
            total = %format_size(stats.total_bytes),
            free = %format_size(stats.free_bytes),
            used = %format_size(stats.used_bytes),
            free_percent = %format!("{:.1}", stats.free_percent()),
            objects = stats.object_count,
            "Store usage"
        );
        Ok(())
    }

    /// Log where an object lives
    pub fn log_object(&self, id: ObjectId) -> Result<()> {
        let loc = self.index.location(id)?;
        info!(
            id = %id,
            class = loc.size_class(),
            offset = loc.offset(),
            size = %format_size(loc.block_bytes()),
            "Object"
        );
        Ok(())
    }

    fn check_loc(&self, loc: Loc) -> Result<()> {
        if loc.end() > self.data.len() {
            return Err(StoreError::InvalidLocation(loc.raw()));
        }
        Ok(())
    }

    /// The allocator and its view of the data file
    fn parts(&mut self) -> (&mut BuddyAllocator, DataBacking<'_>) {
        (
            &mut self.allocator,
            DataBacking {
                data: &mut self.data,
                index: &mut self.index,
            },
        )
    }
}

/// The data file as the allocator sees it
///
/// Head and size class changes go straight into the index header.
struct DataBacking<'a> {
    data: &'a mut MappedRegion,
    index: &'a mut ObjectIndex,
}

impl Backing for DataBacking<'_> {
    fn len(&self) -> u64 {
        self.data.len()
    }

    fn resize_to(&mut self, new_len: u64) -> Result<()> {
        self.data.resize(new_len)
    }

    fn read_link(&self, offset: u64) -> Result<u64> {
        self.data.read_u64(offset)
    }

    fn write_link(&mut self, offset: u64, raw: u64) -> Result<()> {
        self.data.write_u64(offset, raw)
    }

    fn fill(&mut self, offset: u64, len: u64, byte: u8) -> Result<()> {
        self.data.bytes_mut(offset, len)?.fill(byte);
        Ok(())
    }

    fn record_free_head(&mut self, class: usize, raw: u64) -> Result<()> {
        self.index.write_free_head(class, raw)
    }

    fn record_size_class(&mut self, class: usize) -> Result<()> {
        self.index.write_data_size_class(class)
    }
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Free blocks per size class
    pub free_counts: [u64; NUM_SIZE_CLASSES],
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub object_count: u64,
    pub data_size_class: usize,
}

impl StoreStats {
    /// Free bytes as a percentage of the data file
    pub fn free_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.free_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Index and data file paths for a prefix
pub fn store_paths(prefix: &Path) -> (PathBuf, PathBuf) {
    let with_suffix = |suffix: &str| {
        let mut name = OsString::from(prefix.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    };
    (with_suffix(INDEX_SUFFIX), with_suffix(DATA_SUFFIX))
}
