use crate::core::allocator::buddy::MIN_DATA_SIZE_CLASS;
use crate::core::error::{Result, StoreError};
use crate::core::size_class::NUM_SIZE_CLASSES;

pub const MAGIC: [u8; 8] = *b"FIBSTOR\0";
pub const VERSION: u64 = 1;

/// Byte offset of the object location table; everything below is header
pub const TABLE_OFFSET: u64 = 2048;

const VERSION_OFFSET: usize = 8;
const OBJECT_COUNT_OFFSET: usize = 16;
const SIZE_CLASS_OFFSET: usize = 24;
const FREE_HEADS_OFFSET: usize = 32;
const FREE_HEADS_END: usize = FREE_HEADS_OFFSET + NUM_SIZE_CLASSES * 8;

/// Index file header
///
/// Occupies the first 2 KiB of the index file and holds everything needed
/// to reinterpret the data file on load: the data file size class and the
/// 64 free-list heads. The object location table starts right after it.
///
/// ```text
/// 0     magic "FIBSTOR\0"
/// 8     format version
/// 16    live object count
/// 24    data file size class
/// 32    free-list heads, 64 x u64
/// 544   reserved (zero) up to 2048
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub magic: [u8; 8],
    pub version: u64,

    /// Bound handles, maintained as handles are issued and released
    pub object_count: u64,

    /// Size class of the whole data file
    pub data_size_class: u64,

    /// Raw free-list head locations, one per size class
    pub free_heads: [u64; NUM_SIZE_CLASSES],
}

impl IndexHeader {
    /// Header for an empty store whose data file is one block of `size_class`
    pub fn new(size_class: usize) -> Self {
        IndexHeader {
            magic: MAGIC,
            version: VERSION,
            object_count: 0,
            data_size_class: size_class as u64,
            free_heads: [0; NUM_SIZE_CLASSES],
        }
    }

    /// Validate magic, version and the recorded size class
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StoreError::InvalidMagic);
        }

        if self.version != VERSION {
            return Err(StoreError::UnsupportedVersion(self.version));
        }

        let class = self.data_size_class;
        if class < MIN_DATA_SIZE_CLASS as u64 || class >= NUM_SIZE_CLASSES as u64 {
            return Err(StoreError::CorruptIndex(format!(
                "data size class {} out of range",
                class
            )));
        }

        Ok(())
    }

    /// Data size class as an index into the size table
    ///
    /// Only meaningful once [`IndexHeader::validate`] has passed.
    pub fn size_class(&self) -> usize {
        self.data_size_class as usize
    }

    /// Serialize to exactly `TABLE_OFFSET` bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TABLE_OFFSET as usize);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.object_count.to_le_bytes());
        bytes.extend_from_slice(&self.data_size_class.to_le_bytes());
        for head in &self.free_heads {
            bytes.extend_from_slice(&head.to_le_bytes());
        }

        // Reserved tail
        bytes.resize(TABLE_OFFSET as usize, 0);

        bytes
    }

    /// Deserialize and validate
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FREE_HEADS_END {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for index header",
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[..8]);

        let mut free_heads = [0u64; NUM_SIZE_CLASSES];
        for (class, head) in free_heads.iter_mut().enumerate() {
            *head = read_le(bytes, FREE_HEADS_OFFSET + class * 8);
        }

        let header = IndexHeader {
            magic,
            version: read_le(bytes, VERSION_OFFSET),
            object_count: read_le(bytes, OBJECT_COUNT_OFFSET),
            data_size_class: read_le(bytes, SIZE_CLASS_OFFSET),
            free_heads,
        };
        header.validate()?;

        Ok(header)
    }
}

/// Byte offset of the live object count within the header
pub(crate) const fn object_count_offset() -> u64 {
    OBJECT_COUNT_OFFSET as u64
}

/// Byte offset of the data size class within the header
pub(crate) const fn size_class_offset() -> u64 {
    SIZE_CLASS_OFFSET as u64
}

/// Byte offset of the free-list head for `class`
pub(crate) const fn free_head_offset(class: usize) -> u64 {
    (FREE_HEADS_OFFSET + class * 8) as u64
}

fn read_le(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}
