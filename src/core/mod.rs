//! Storage engine
//!
//! - [`size_class`] - the Fibonacci block size table
//! - [`loc`] - block locations and their on-disk encoding
//! - [`region`] - growable memory-mapped files
//! - [`allocator`] - free lists and the buddy allocator
//! - [`index`] - index header and the handle table
//! - [`store`] - the [`FileStore`] facade tying them together
//! - [`config`] - [`StoreConfig`]
//! - [`error`] - [`StoreError`]

pub mod allocator;
pub mod config;
pub mod error;
pub mod index;
pub mod loc;
pub mod region;
pub mod size_class;
pub mod store;


pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use store::{FileStore, StoreStats};
