//! Extent-addressed file storage for Quarry.
//!
//! This crate turns a byte-stream file into a fixed-size paged container:
//! - A persisted header (extent 0) carrying the extent size
//! - Whole-extent read/write addressed by extent id
//! - Append-only reservation of zero-filled extents

mod extent;

pub use extent::ExtentStore;
pub use quarry_common::ExtentStoreConfig;
