use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of space: growing to {requested} bytes exceeds the limit of {limit} bytes")]
    OutOfSpace { requested: u64, limit: u64 },

    #[error("Invalid object handle: {0}")]
    InvalidHandle(u32),

    #[error("Allocation of {requested} bytes exceeds the largest size class ({max} bytes)")]
    AllocationTooLarge { requested: u64, max: u64 },

    #[error("Invalid location: {0:#018x}")]
    InvalidLocation(u64),

    #[error("Access of {len} bytes at offset {offset} is outside the {size}-byte region")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Data of {len} bytes does not fit in a {capacity}-byte block")]
    BlockTooSmall { len: u64, capacity: u64 },

    #[error("Invalid magic number in index header")]
    InvalidMagic,

    #[error("Unsupported index format version: {0}")]
    UnsupportedVersion(u64),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
