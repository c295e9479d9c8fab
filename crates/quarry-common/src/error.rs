//! Error types for Quarry.

use crate::page::{ExtentId, PageId};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Errors that can occur in Quarry operations.
///
/// Errors are plain values returned from every fallible operation;
/// lookup misses (`KeyNotFound`) are expected outcomes, not faults.
#[derive(Debug, Error)]
pub enum QuarryError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Extent store errors
    #[error("invalid storage path: {}", path.display())]
    InvalidPath { path: PathBuf },

    #[error("storage path already exists: {}", path.display())]
    PathAlreadyExists { path: PathBuf },

    #[error("storage is not open")]
    NotOpen,

    #[error("extent {extent} out of bounds (store holds {size} extents)")]
    OutOfBoundsExtent { extent: ExtentId, size: u64 },

    #[error("read failed for extent {extent}")]
    OutOfBoundsRead { extent: ExtentId },

    #[error("write failed for extent {extent}")]
    OutOfBoundsWrite { extent: ExtentId },

    #[error("critical storage error: {0}")]
    Critical(String),

    // Buffer pool errors
    #[error("buffer pool full, unable to allocate frame")]
    PoolFull,

    #[error("page not resident in buffer pool: {page_id}")]
    PageNotPinned { page_id: PageId },

    // B+tree errors
    #[error("key not found")]
    KeyNotFound,

    #[error("corrupted index page {page_id}: {reason}")]
    CorruptedPage { page_id: PageId, reason: String },

    #[error("page size {page_size} too small for node layout")]
    PageTooSmall { page_size: usize },

    #[error("index corrupted: {0}")]
    TreeCorrupted(String),
}
