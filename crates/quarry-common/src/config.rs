//! Configuration structures for Quarry storage.

use serde::{Deserialize, Serialize};

/// Configuration persisted in the header extent of a store file.
///
/// The extent size is fixed at creation time and read back on open;
/// every page handed out by the buffer pool is exactly one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentStoreConfig {
    /// Extent size in KiB.
    pub extent_size_kb: u32,
}

impl ExtentStoreConfig {
    /// Size of the encoded config record at the start of extent 0.
    ///
    /// The remainder of the header extent is reserved for future fields
    /// and padded with zeros.
    pub const ENCODED_SIZE: usize = 4;

    /// Creates a config with the given extent size in KiB.
    pub fn new(extent_size_kb: u32) -> Self {
        Self { extent_size_kb }
    }

    /// Returns the extent size in bytes.
    pub fn extent_size(&self) -> usize {
        self.extent_size_kb as usize * 1024
    }

    /// Serializes the config record to bytes.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        self.extent_size_kb.to_le_bytes()
    }

    /// Deserializes the config record from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            extent_size_kb: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        }
    }
}

impl Default for ExtentStoreConfig {
    fn default() -> Self {
        Self { extent_size_kb: 64 }
    }
}
