//! Extent-addressed file store.

use quarry_common::page::HEADER_EXTENT_ID;
use quarry_common::{ExtentId, ExtentStoreConfig, QuarryError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A file divided into fixed-size extents.
///
/// Extent 0 holds the persisted [`ExtentStoreConfig`] and is not reachable
/// through `read`/`write`; extents `1..size()` carry opaque page payloads.
/// The store is not concurrency-safe on its own; callers serialize access.
pub struct ExtentStore {
    /// Open file handle, `None` once closed.
    file: Option<File>,
    /// Configuration read from or written to the header extent.
    config: ExtentStoreConfig,
    /// Current file size in whole extents.
    size: u64,
    /// Reusable zeroed buffer, one extent long, used to extend the file.
    filler: Vec<u8>,
}

impl ExtentStore {
    /// Creates a new store file and leaves it open.
    ///
    /// Fails with `PathAlreadyExists` if the path exists and `overwrite`
    /// is false. On success the file holds one extent (the header) with
    /// the config record at byte 0.
    pub fn create<P: AsRef<Path>>(
        path: P,
        config: ExtentStoreConfig,
        overwrite: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        if config.extent_size_kb == 0 {
            return Err(QuarryError::Critical(
                "extent size must be non-zero".to_string(),
            ));
        }
        if !overwrite && path.exists() {
            return Err(QuarryError::PathAlreadyExists {
                path: path.to_path_buf(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|_| QuarryError::InvalidPath {
                path: path.to_path_buf(),
            })?;

        let mut store = Self {
            file: Some(file),
            config,
            size: 0,
            filler: vec![0u8; config.extent_size()],
        };

        // Reserve the header extent, then write the config record into it.
        store.reserve(1)?;
        let file = store.handle()?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| QuarryError::Critical(format!("seek failed: {e}")))?;
        file.write_all(&config.to_bytes()).map_err(|_| {
            QuarryError::OutOfBoundsWrite {
                extent: HEADER_EXTENT_ID,
            }
        })?;
        file.flush().map_err(|_| QuarryError::OutOfBoundsWrite {
            extent: HEADER_EXTENT_ID,
        })?;

        Ok(store)
    }

    /// Opens an existing store file and reads its config from extent 0.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| QuarryError::InvalidPath {
                path: path.to_path_buf(),
            })?;

        let mut header = [0u8; ExtentStoreConfig::ENCODED_SIZE];
        file.seek(SeekFrom::Start(0))
            .map_err(|e| QuarryError::Critical(format!("seek failed: {e}")))?;
        file.read_exact(&mut header)
            .map_err(|_| QuarryError::Critical("failed to read storage header".to_string()))?;
        let config = ExtentStoreConfig::from_bytes(&header);
        if config.extent_size_kb == 0 {
            return Err(QuarryError::Critical(
                "invalid extent size in header".to_string(),
            ));
        }

        let len = file
            .seek(SeekFrom::End(0))
            .map_err(|e| QuarryError::Critical(format!("seek failed: {e}")))?;
        let size = len / config.extent_size() as u64;

        Ok(Self {
            file: Some(file),
            config,
            size,
            filler: vec![0u8; config.extent_size()],
        })
    }

    /// Closes the underlying file. The store can be reopened afterward.
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                file.sync_all()?;
                Ok(())
            }
            None => Err(QuarryError::NotOpen),
        }
    }

    /// Appends `num_extents` zero-filled extents and returns the id of the
    /// first one. `size()` grows by exactly `num_extents`.
    pub fn reserve(&mut self, num_extents: u32) -> Result<ExtentId> {
        let extent_size = self.config.extent_size() as u64;
        let Self { file, filler, .. } = self;
        let file = file.as_mut().ok_or(QuarryError::NotOpen)?;

        let end = file
            .seek(SeekFrom::End(0))
            .map_err(|e| QuarryError::Critical(format!("seek failed: {e}")))?;
        let first = end / extent_size;
        if num_extents == 0 {
            return Ok(first);
        }

        // Seek to the last new extent and write one zeroed filler extent;
        // the filesystem zero-fills the gap in between.
        let gap = (num_extents as u64 - 1) * extent_size;
        file.seek(SeekFrom::End(gap as i64))
            .map_err(|e| QuarryError::Critical(format!("seek failed: {e}")))?;
        file.write_all(filler)
            .map_err(|_| QuarryError::OutOfBoundsWrite {
                extent: first + num_extents as u64 - 1,
            })?;

        self.size = (end + num_extents as u64 * extent_size) / extent_size;
        Ok(first)
    }

    /// Reads exactly one extent into `data`.
    ///
    /// The header extent and extents beyond the end of the store are
    /// rejected with `OutOfBoundsExtent`.
    pub fn read(&mut self, data: &mut [u8], extent: ExtentId) -> Result<()> {
        let size = self.size;
        let extent_size = self.extent_size();
        if extent == HEADER_EXTENT_ID || extent >= size {
            return Err(QuarryError::OutOfBoundsExtent { extent, size });
        }
        if data.len() != extent_size {
            return Err(QuarryError::OutOfBoundsRead { extent });
        }

        let file = self.handle()?;
        file.seek(SeekFrom::Start(extent * extent_size as u64))
            .map_err(|e| QuarryError::Critical(format!("seek failed: {e}")))?;
        file.read_exact(data)
            .map_err(|_| QuarryError::OutOfBoundsRead { extent })
    }

    /// Writes exactly one extent from `data`. Same bounds rules as `read`.
    pub fn write(&mut self, data: &[u8], extent: ExtentId) -> Result<()> {
        let size = self.size;
        let extent_size = self.extent_size();
        if extent == HEADER_EXTENT_ID || extent >= size {
            return Err(QuarryError::OutOfBoundsExtent { extent, size });
        }
        if data.len() != extent_size {
            return Err(QuarryError::OutOfBoundsWrite { extent });
        }

        let file = self.handle()?;
        file.seek(SeekFrom::Start(extent * extent_size as u64))
            .map_err(|e| QuarryError::Critical(format!("seek failed: {e}")))?;
        file.write_all(data)
            .map_err(|_| QuarryError::OutOfBoundsWrite { extent })
    }

    /// Flushes all written data to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        let file = self.handle()?;
        file.sync_all()?;
        Ok(())
    }

    /// Returns the current store size in extents (header included).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the persisted configuration.
    pub fn config(&self) -> &ExtentStoreConfig {
        &self.config
    }

    /// Returns the extent size in bytes.
    pub fn extent_size(&self) -> usize {
        self.config.extent_size()
    }

    /// Returns true if the store has an open file.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn handle(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(QuarryError::NotOpen)
    }
}

impl Drop for ExtentStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("test.db")
    }

    #[test]
    fn test_create_close_open_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        store.close().unwrap();

        let store = ExtentStore::open(&path).unwrap();
        assert_eq!(store.config().extent_size_kb, 4);
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_reserve_sequence() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(64), true).unwrap();
        store.close().unwrap();

        let mut store = ExtentStore::open(&path).unwrap();
        assert_eq!(store.reserve(1).unwrap(), 1);
        assert_eq!(store.reserve(1).unwrap(), 2);
        assert_eq!(store.reserve(4).unwrap(), 3);
        assert_eq!(store.reserve(1).unwrap(), 7);
        assert_eq!(store.size(), 8);
    }

    #[test]
    fn test_read_write_pattern_across_reopen() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(64), true).unwrap();
        let extent_size = store.extent_size();
        let first = store.reserve(63).unwrap();
        assert_eq!(first, 1);

        for eid in first..first + 63 {
            let data = vec![b'0' + (eid % 10) as u8; extent_size];
            store.write(&data, eid).unwrap();
        }
        store.close().unwrap();

        let mut store = ExtentStore::open(&path).unwrap();
        let mut data = vec![0u8; extent_size];
        for eid in first..first + 63 {
            store.read(&mut data, eid).unwrap();
            let expected = b'0' + (eid % 10) as u8;
            assert!(data.iter().all(|&b| b == expected), "extent {eid} corrupt");
        }
    }

    #[test]
    fn test_bounds_errors() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(64), true).unwrap();
        let mut data = vec![0u8; store.extent_size()];

        assert!(matches!(
            store.write(&data, 63),
            Err(QuarryError::OutOfBoundsExtent { extent: 63, .. })
        ));
        assert!(matches!(
            store.read(&mut data, 32),
            Err(QuarryError::OutOfBoundsExtent { extent: 32, .. })
        ));
    }

    #[test]
    fn test_header_extent_is_protected() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        store.reserve(2).unwrap();
        let mut data = vec![0u8; store.extent_size()];

        assert!(matches!(
            store.read(&mut data, 0),
            Err(QuarryError::OutOfBoundsExtent { extent: 0, .. })
        ));
        assert!(matches!(
            store.write(&data, 0),
            Err(QuarryError::OutOfBoundsExtent { extent: 0, .. })
        ));
    }

    #[test]
    fn test_create_existing_without_overwrite() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(64), true).unwrap();
        store.close().unwrap();

        let result = ExtentStore::create(&path, ExtentStoreConfig::new(64), false);
        assert!(matches!(
            result,
            Err(QuarryError::PathAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_create_with_overwrite_truncates() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        store.reserve(10).unwrap();
        store.close().unwrap();

        let store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_close_not_open() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(store.close(), Err(QuarryError::NotOpen)));
    }

    #[test]
    fn test_io_after_close_fails() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        store.reserve(1).unwrap();
        let mut data = vec![0u8; store.extent_size()];
        store.close().unwrap();

        assert!(matches!(
            store.reserve(1),
            Err(QuarryError::NotOpen)
        ));
        assert!(matches!(
            store.read(&mut data, 1),
            Err(QuarryError::NotOpen)
        ));
    }

    #[test]
    fn test_open_invalid_path() {
        let result = ExtentStore::open("/no/such/dir/test.db");
        assert!(matches!(result, Err(QuarryError::InvalidPath { .. })));
    }

    #[test]
    fn test_reserve_zero_fills() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        let first = store.reserve(4).unwrap();
        let mut data = vec![0xFFu8; store.extent_size()];
        for eid in first..first + 4 {
            store.read(&mut data, eid).unwrap();
            assert!(data.iter().all(|&b| b == 0), "extent {eid} not zeroed");
        }
    }

    #[test]
    fn test_reserve_grows_size_exactly() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        for n in [1u32, 3, 7] {
            let before = store.size();
            store.reserve(n).unwrap();
            assert_eq!(store.size(), before + n as u64);
        }
    }

    #[test]
    fn test_mismatched_buffer_length() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        store.reserve(1).unwrap();

        let mut short = vec![0u8; 100];
        assert!(matches!(
            store.read(&mut short, 1),
            Err(QuarryError::OutOfBoundsRead { extent: 1 })
        ));
        assert!(matches!(
            store.write(&short, 1),
            Err(QuarryError::OutOfBoundsWrite { extent: 1 })
        ));
    }

    #[test]
    fn test_write_read_roundtrip_single_extent() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut store = ExtentStore::create(&path, ExtentStoreConfig::new(4), true).unwrap();
        let eid = store.reserve(1).unwrap();

        let mut data = vec![0u8; store.extent_size()];
        data[0] = 0xAB;
        data[100] = 0xCD;
        let last = data.len() - 1;
        data[last] = 0xEF;
        store.write(&data, eid).unwrap();

        let mut read_back = vec![0u8; store.extent_size()];
        store.read(&mut read_back, eid).unwrap();
        assert_eq!(read_back, data);
    }
}
