//! Store configuration
//!
//! Limits and initial sizes for a [`crate::core::store::FileStore`]. Every
//! field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! initial_size_class = 10
//! max_data_size = 1073741824
//! zero_on_reset = true
//! ```

use crate::core::allocator::buddy::MIN_DATA_SIZE_CLASS;
use crate::core::error::{Result, StoreError};
use crate::core::index::MIN_INDEX_SIZE;
use crate::core::size_class::{size_of, NUM_SIZE_CLASSES};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Store limits and initial sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Size class of a freshly reset data file
    ///
    /// Must be in `2..64`. The default, class 8, is 440 bytes.
    pub initial_size_class: usize,

    /// Ceiling for the data file length in bytes
    pub max_data_size: u64,

    /// Initial index file length in bytes
    ///
    /// Holds the 2 KiB header plus the handle table; 4096 bytes gives 255
    /// handles.
    pub index_initial_size: u64,

    /// Ceiling for the index file length in bytes
    pub max_index_size: u64,

    /// Zero the data file on reset instead of relying on sparse extension
    pub zero_on_reset: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            initial_size_class: 8,
            max_data_size: size_of(53),
            index_initial_size: 4096,
            max_index_size: 1 << 30,
            zero_on_reset: false,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial data size class
    pub fn with_initial_size_class(mut self, class: usize) -> Self {
        self.initial_size_class = class;
        self
    }

    /// Set the data file ceiling
    pub fn with_max_data_size(mut self, bytes: u64) -> Self {
        self.max_data_size = bytes;
        self
    }

    /// Set the initial index file length
    pub fn with_index_initial_size(mut self, bytes: u64) -> Self {
        self.index_initial_size = bytes;
        self
    }

    /// Set the index file ceiling
    pub fn with_max_index_size(mut self, bytes: u64) -> Self {
        self.max_index_size = bytes;
        self
    }

    /// Zero data on reset
    pub fn with_zero_on_reset(mut self, zero: bool) -> Self {
        self.zero_on_reset = zero;
        self
    }

    /// Check that the limits are consistent
    pub fn validate(&self) -> Result<()> {
        let class = self.initial_size_class;
        if !(MIN_DATA_SIZE_CLASS..NUM_SIZE_CLASSES).contains(&class) {
            return Err(StoreError::Config(format!(
                "initial_size_class {} must be in {}..{}",
                class, MIN_DATA_SIZE_CLASS, NUM_SIZE_CLASSES
            )));
        }

        if size_of(class) > self.max_data_size {
            return Err(StoreError::Config(format!(
                "initial data size {} exceeds max_data_size {}",
                size_of(class),
                self.max_data_size
            )));
        }

        let index = self.index_initial_size;
        if index < MIN_INDEX_SIZE || index % 8 != 0 {
            return Err(StoreError::Config(format!(
                "index_initial_size {} must be a multiple of 8 and at least {}",
                index, MIN_INDEX_SIZE
            )));
        }

        if index > self.max_index_size {
            return Err(StoreError::Config(format!(
                "index_initial_size {} exceeds max_index_size {}",
                index, self.max_index_size
            )));
        }

        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| StoreError::Config(e.to_string()))
    }
}
