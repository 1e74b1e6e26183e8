//! Memory-mapped file regions
//!
//! A [`MappedRegion`] owns one open file and one read/write shared mapping
//! over its full length. Both the index file and the data file are regions.
//!
//! Growing or shrinking a region changes the file length and remaps it. On
//! Linux the kernel is first asked to resize the mapping in place so the base
//! address is kept; if that fails the mapping may move. Callers never hold
//! pointers across a resize: every accessor borrows the region, and
//! [`MappedRegion::resize`] takes `&mut self`, so the borrow checker rejects
//! any slice that would outlive a remap. Locations are plain byte offsets and
//! stay valid across a move.

use crate::core::error::{Result, StoreError};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A growable memory-mapped file
pub struct MappedRegion {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    len: u64,
    max_len: u64,
    was_empty: bool,

    /// Written through `bytes_mut` since the last flush
    dirty: bool,
}

impl MappedRegion {
    /// Open a file read/write, creating it if absent
    ///
    /// Files shorter than `initial_len` are extended (sparse) before mapping.
    /// Longer files are mapped as they are.
    pub fn open_or_create<P: AsRef<Path>>(path: P, initial_len: u64, max_len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if initial_len == 0 {
            return Err(StoreError::Config(format!(
                "initial length of {} must be non-zero",
                path.display()
            )));
        }
        if initial_len > max_len {
            return Err(StoreError::OutOfSpace {
                requested: initial_len,
                limit: max_len,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let existing_len = file.metadata()?.len();
        let was_empty = existing_len == 0;
        let len = existing_len.max(initial_len);
        if len > max_len {
            return Err(StoreError::OutOfSpace {
                requested: len,
                limit: max_len,
            });
        }
        if existing_len < len {
            file.set_len(len)?;
        }

        // SAFETY: the file is opened read/write by this region alone and the
        // mapping lives exactly as long as the region. Store files are not
        // meant to be modified by other processes while open.
        let mmap = unsafe { MmapOptions::new().len(to_usize(len)?).map_mut(&file)? };

        debug!(path = %path.display(), len, was_empty, "Mapped region");

        Ok(MappedRegion {
            file,
            mmap,
            path,
            len,
            max_len,
            was_empty,
            dirty: false,
        })
    }

    /// Set the file length to exactly `new_len` and remap
    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        if new_len == self.len {
            return Ok(());
        }
        if new_len == 0 {
            return Err(StoreError::Config(format!(
                "cannot resize {} to zero bytes",
                self.path.display()
            )));
        }
        if new_len > self.max_len {
            return Err(StoreError::OutOfSpace {
                requested: new_len,
                limit: self.max_len,
            });
        }

        let growing = new_len > self.len;
        if growing {
            // Extend before mapping the new tail
            self.file.set_len(new_len)?;
        } else {
            // Push dirty pages out before the tail is cut off
            self.mmap.flush()?;
        }

        if let Err(e) = self.remap(new_len) {
            if growing {
                // Keep file length and mapping consistent
                let _ = self.file.set_len(self.len);
            }
            return Err(e);
        }

        if !growing {
            self.file.set_len(new_len)?;
        }

        debug!(
            path = %self.path.display(),
            from = self.len,
            to = new_len,
            "Resized region"
        );
        self.len = new_len;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn remap(&mut self, new_len: u64) -> Result<()> {
        use memmap2::RemapOptions;

        let new_len = to_usize(new_len)?;

        // SAFETY: `&mut self` guarantees no outstanding borrows of the mapped
        // bytes, and the file already covers `new_len` bytes.
        let in_place = unsafe { self.mmap.remap(new_len, RemapOptions::new().may_move(false)) };
        if in_place.is_ok() {
            return Ok(());
        }

        let before = self.mmap.as_ptr();
        // SAFETY: as above.
        unsafe { self.mmap.remap(new_len, RemapOptions::new().may_move(true))? };
        debug!(
            path = %self.path.display(),
            moved = before != self.mmap.as_ptr(),
            "Remapped region"
        );
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn remap(&mut self, new_len: u64) -> Result<()> {
        // SAFETY: `&mut self` guarantees no outstanding borrows of the mapped
        // bytes, and the file already covers `new_len` bytes. The old mapping
        // is dropped when replaced.
        self.mmap = unsafe {
            MmapOptions::new()
                .len(to_usize(new_len)?)
                .map_mut(&self.file)?
        };
        Ok(())
    }

    /// Synchronously write dirty pages back to the file
    ///
    /// A region with no writes since its last flush is left alone.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.mmap.flush()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Whether the mapping has been written since the last flush
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current file (and mapping) length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ceiling for [`MappedRegion::resize`]
    pub fn max_len(&self) -> u64 {
        self.max_len
    }

    /// Whether the file had zero length before this region opened it
    pub fn was_empty(&self) -> bool {
        self.was_empty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(offset as usize..end as usize),
            _ => Err(StoreError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    /// Borrow `len` bytes starting at `offset`
    pub fn bytes(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let range = self.check_range(offset, len)?;
        Ok(&self.mmap[range])
    }

    /// Mutably borrow `len` bytes starting at `offset`
    pub fn bytes_mut(&mut self, offset: u64, len: u64) -> Result<&mut [u8]> {
        let range = self.check_range(offset, len)?;
        self.dirty = true;
        Ok(&mut self.mmap[range])
    }

    /// Read a little-endian `u64`
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let bytes = self.bytes(offset, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    /// Write a little-endian `u64`
    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.bytes_mut(offset, 8)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if !self.dirty {
            return;
        }
        if let Err(e) = self.mmap.flush() {
            warn!(path = %self.path.display(), error = %e, "Failed to flush region on close");
        }
    }
}

fn to_usize(len: u64) -> Result<usize> {
    usize::try_from(len).map_err(|_| StoreError::OutOfSpace {
        requested: len,
        limit: usize::MAX as u64,
    })
}
