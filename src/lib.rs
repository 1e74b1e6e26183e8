//! # fibstore - File-Backed Object Store
//!
//! `fibstore` keeps variable-length byte objects in a memory-mapped data
//! file, addressed through stable integer handles stored in a second
//! memory-mapped index file.
//!
//! - **Fibonacci buddy allocation**: 64 block sizes (8 B up to ~137 TB),
//!   each the sum of the two below it
//! - **Append-only growth**: the data file grows one size class at a time
//!   and existing blocks never move
//! - **Stable handles**: objects can be resized and relocated without their
//!   handle changing
//! - **Persistent**: allocator state is written into the index as it
//!   changes, so a store reloads consistently even if its process was killed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fibstore::{FileStore, Result, StoreConfig};
//!
//! # fn main() -> Result<()> {
//! let mut store = FileStore::create("/tmp/example-", StoreConfig::default())?;
//!
//! let id = store.new_object(13)?;
//! store.write_object(id, b"Hello, world!")?;
//! assert_eq!(&store.object(id)?[..13], b"Hello, world!");
//!
//! store.flush()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sharing a Store
//!
//! `FileStore` itself is single-threaded. [`SharedStore`] wraps one in a
//! mutex for callers that need to hand it to several threads:
//!
//! ```rust,no_run
//! use fibstore::{Result, StoreBuilder};
//!
//! # fn main() -> Result<()> {
//! let shared = StoreBuilder::new()
//!     .prefix("/tmp/shared-")
//!     .initial_size_class(12)
//!     .shared()?;
//!
//! let worker = shared.clone();
//! std::thread::spawn(move || worker.with(|store| store.new_object(64)))
//!     .join()
//!     .unwrap()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    allocator::{Backing, BuddyAllocator, FreeLists},
    config::StoreConfig,
    error::{Result, StoreError},
    index::{IndexHeader, ObjectId},
    loc::Loc,
    region::MappedRegion,
    size_class::{format_size, size_of, NUM_SIZE_CLASSES},
    store::{FileStore, StoreStats},
};

use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A [`FileStore`] shared between threads
///
/// Every operation takes the lock for its duration. Borrowed blocks cannot
/// escape the lock, so use [`SharedStore::with`] or [`SharedStore::lock`]
/// to work on object contents in place.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<FileStore>>,
}

impl SharedStore {
    pub fn new(store: FileStore) -> Self {
        SharedStore {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Lock the store
    pub fn lock(&self) -> MutexGuard<'_, FileStore> {
        self.inner.lock()
    }

    /// Run `f` with the store locked
    pub fn with<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut FileStore) -> R,
    {
        f(&mut *self.inner.lock())
    }

    pub fn new_object(&self, bytes: u64) -> Result<ObjectId> {
        self.inner.lock().new_object(bytes)
    }

    pub fn write_object(&self, id: ObjectId, bytes: &[u8]) -> Result<()> {
        self.inner.lock().write_object(id, bytes)
    }

    pub fn read_object(&self, id: ObjectId) -> Result<Vec<u8>> {
        self.inner.lock().read_object(id)
    }

    pub fn delete_object(&self, id: ObjectId) -> Result<()> {
        self.inner.lock().delete_object(id)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    /// Take the store back if this is the last handle to it
    pub fn into_inner(self) -> Option<FileStore> {
        Arc::try_unwrap(self.inner).ok().map(Mutex::into_inner)
    }
}

/// Builder for opening a store
///
/// # Examples
///
/// ```rust,no_run
/// use fibstore::StoreBuilder;
///
/// # fn main() -> fibstore::Result<()> {
/// let store = StoreBuilder::new()
///     .prefix("/data/objects-")
///     .max_data_size(1 << 30)
///     .zero_on_reset(true)
///     .load()?;
/// # Ok(())
/// # }
/// ```
pub struct StoreBuilder {
    prefix: Option<PathBuf>,
    config: StoreConfig,
}

impl StoreBuilder {
    pub fn new() -> Self {
        StoreBuilder {
            prefix: None,
            config: StoreConfig::default(),
        }
    }

    /// Set the file name prefix
    pub fn prefix<P: AsRef<Path>>(mut self, prefix: P) -> Self {
        self.prefix = Some(prefix.as_ref().to_path_buf());
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn initial_size_class(mut self, class: usize) -> Self {
        self.config = self.config.with_initial_size_class(class);
        self
    }

    pub fn max_data_size(mut self, bytes: u64) -> Self {
        self.config = self.config.with_max_data_size(bytes);
        self
    }

    pub fn index_initial_size(mut self, bytes: u64) -> Self {
        self.config = self.config.with_index_initial_size(bytes);
        self
    }

    pub fn max_index_size(mut self, bytes: u64) -> Self {
        self.config = self.config.with_max_index_size(bytes);
        self
    }

    pub fn zero_on_reset(mut self, zero: bool) -> Self {
        self.config = self.config.with_zero_on_reset(zero);
        self
    }

    /// Create an empty store, discarding existing files
    pub fn create(self) -> Result<FileStore> {
        let (prefix, config) = self.into_parts()?;
        debug!(prefix = %prefix.display(), "Building new store");
        FileStore::create(prefix, config)
    }

    /// Open the store, creating it if absent
    pub fn load(self) -> Result<FileStore> {
        let (prefix, config) = self.into_parts()?;
        debug!(prefix = %prefix.display(), "Loading store");
        FileStore::load(prefix, config)
    }

    /// Open the store and wrap it for sharing
    pub fn shared(self) -> Result<SharedStore> {
        self.load().map(SharedStore::new)
    }

    fn into_parts(self) -> Result<(PathBuf, StoreConfig)> {
        let prefix = self
            .prefix
            .ok_or_else(|| StoreError::Config("store prefix must be set".to_string()))?;
        Ok((prefix, self.config))
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
