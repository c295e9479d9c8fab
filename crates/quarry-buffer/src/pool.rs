//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::ClockReplacer;
use parking_lot::Mutex;
use quarry_common::{PageId, QuarryError, Result};
use quarry_storage::ExtentStore;
use std::collections::HashSet;
use sysinfo::System;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// A pinned page: its id plus access to the frame buffer holding it.
///
/// The handle does not unpin on drop; callers own the pin and match every
/// successful `pin`/`alloc` with exactly one `unpin`. Scoped release lives
/// one layer up, in the index node handles.
pub struct PageHandle<'a> {
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageHandle<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns read access to the page bytes.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'a, Box<[u8]>> {
        self.frame.read_data()
    }

    /// Returns write access to the page bytes.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'a, Box<[u8]>> {
        self.frame.write_data()
    }
}

/// Buffer pool manager.
///
/// Maps extents of an [`ExtentStore`] to a fixed set of in-memory frames:
/// - Page ID to frame ID mapping (lock-free page table)
/// - Free frame list plus clock replacement for eviction
/// - Pin counting; only unpinned frames are eviction victims
/// - Dirty write-back to the store on eviction and on flush
/// - Released extents are recycled before the file grows
pub struct BufferPool {
    /// Backing extent store.
    store: Mutex<ExtentStore>,
    /// Page size in bytes (one extent).
    page_size: usize,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping.
    page_table: PageTable,
    /// List of free frame IDs.
    free_frames: Mutex<Vec<FrameId>>,
    /// Released extents available for reuse by `alloc`.
    free_pages: Mutex<Vec<PageId>>,
    /// Released pages whose frames are still pinned; freed on last unpin.
    pending_free: Mutex<HashSet<PageId>>,
    /// Page replacement policy.
    replacer: ClockReplacer,
}

impl BufferPool {
    /// Creates a new buffer pool over an open store.
    pub fn new(store: ExtentStore, config: BufferPoolConfig) -> Result<Self> {
        if !store.is_open() {
            return Err(QuarryError::NotOpen);
        }
        let page_size = store.extent_size();
        let num_frames = config.num_frames.max(1);

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32), page_size))
            .collect();
        let free_frames: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Ok(Self {
            store: Mutex::new(store),
            page_size,
            frames,
            page_table: PageTable::new(num_frames),
            free_frames: Mutex::new(free_frames),
            free_pages: Mutex::new(Vec::new()),
            pending_free: Mutex::new(HashSet::new()),
            replacer: ClockReplacer::new(num_frames),
        })
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames so caching stays useful on low-memory systems.
    pub fn auto_sized(store: ExtentStore) -> Result<Self> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / store.extent_size()).max(1_000);

        Self::new(store, BufferPoolConfig { num_frames })
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_frames.lock().len()
    }

    /// Returns the number of pages currently resident in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Checks if a page is resident in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Allocates a new page and pins it.
    ///
    /// Reuses a previously released extent when one is available, otherwise
    /// reserves a fresh extent at the end of the store. The page is marked
    /// dirty immediately so reused extents never resurrect stale bytes.
    pub fn alloc(&self) -> Result<PageHandle<'_>> {
        let page_id = match self.free_pages.lock().pop() {
            Some(pid) => pid,
            None => PageId::new(self.store.lock().reserve(1)?),
        };

        let frame_id = match self.take_frame() {
            Ok(fid) => fid,
            Err(e) => {
                // Keep the reserved extent for the next alloc.
                self.free_pages.lock().push(page_id);
                return Err(e);
            }
        };

        let frame = &self.frames[frame_id.0 as usize];
        frame.set_page_id(Some(page_id));
        frame.pin();
        frame.set_dirty(true);

        self.page_table.insert(page_id, frame_id);
        self.replacer.access_and_pin(frame_id);

        Ok(PageHandle { page_id, frame })
    }

    /// Pins an existing page, faulting it in from the store if needed.
    ///
    /// A page may be pinned multiple times concurrently; each pin must be
    /// matched by exactly one `unpin`.
    pub fn pin(&self, page_id: PageId) -> Result<PageHandle<'_>> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.access_and_pin(frame_id);
            return Ok(PageHandle { page_id, frame });
        }

        let frame_id = self.take_frame()?;
        let frame = &self.frames[frame_id.0 as usize];
        {
            let mut data = frame.write_data();
            if let Err(e) = self.store.lock().read(&mut data, page_id.extent()) {
                drop(data);
                self.free_frames.lock().push(frame_id);
                return Err(e);
            }
        }
        frame.set_page_id(Some(page_id));
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.access_and_pin(frame_id);

        Ok(PageHandle { page_id, frame })
    }

    /// Drops one pin on a page.
    ///
    /// When the pin count reaches zero the page becomes evictable, or is
    /// discarded outright if a `release` was deferred on it.
    pub fn unpin(&self, page_id: PageId) -> Result<()> {
        let frame_id = self
            .page_table
            .get(page_id)
            .ok_or(QuarryError::PageNotPinned { page_id })?;
        let frame = &self.frames[frame_id.0 as usize];

        if frame.unpin() == 0 {
            if self.pending_free.lock().remove(&page_id) {
                self.discard_resident(page_id, frame_id);
                self.free_pages.lock().push(page_id);
            } else {
                self.replacer.set_evictable(frame_id, true);
            }
        }
        Ok(())
    }

    /// Marks a still-pinned page dirty; it will be written back on
    /// eviction or flush.
    pub fn set_page_dirty(&self, page_id: PageId) -> Result<()> {
        let frame_id = self
            .page_table
            .get(page_id)
            .ok_or(QuarryError::PageNotPinned { page_id })?;
        self.frames[frame_id.0 as usize].set_dirty(true);
        Ok(())
    }

    /// Returns a page's extent to the free list for reuse.
    ///
    /// If the page is still pinned the free is deferred until the last pin
    /// drops. Released contents are discarded, never written back.
    pub fn release(&self, page_id: PageId) -> Result<()> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                self.pending_free.lock().insert(page_id);
                return Ok(());
            }
            self.discard_resident(page_id, frame_id);
        }
        self.free_pages.lock().push(page_id);
        Ok(())
    }

    /// Writes a page back to the store if it is dirty.
    ///
    /// Returns true if the page was flushed.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                self.write_back(frame, page_id)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Writes all dirty resident pages back to the store and syncs it.
    ///
    /// This is the durability boundary: a tree whose pages have been
    /// flushed survives a crash or reopen. Returns the number of pages
    /// written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut resident = Vec::new();
        self.page_table.for_each(|page_id, frame_id| {
            resident.push((page_id, frame_id));
            true
        });

        let mut flushed = 0;
        for (page_id, frame_id) in resident {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                self.write_back(frame, page_id)?;
                flushed += 1;
            }
        }
        self.store.lock().sync()?;
        Ok(flushed)
    }

    /// Allocates a frame: from the free list first, then by eviction.
    fn take_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_frames.lock().pop() {
            return Ok(frame_id);
        }

        let victim = self.replacer.evict().ok_or(QuarryError::PoolFull)?;
        let frame = &self.frames[victim.0 as usize];

        if let Some(old_page) = frame.page_id() {
            if frame.is_dirty() {
                if let Err(e) = self.write_back(frame, old_page) {
                    // Leave the page resident and evictable again.
                    self.replacer.set_evictable(victim, true);
                    return Err(e);
                }
            }
            self.page_table.remove(old_page);
        }
        frame.reset();
        Ok(victim)
    }

    /// Drops a resident page without write-back and recycles its frame.
    fn discard_resident(&self, page_id: PageId, frame_id: FrameId) {
        self.page_table.remove(page_id);
        self.replacer.remove(frame_id);
        self.frames[frame_id.0 as usize].reset();
        self.free_frames.lock().push(frame_id);
    }

    fn write_back(&self, frame: &BufferFrame, page_id: PageId) -> Result<()> {
        let data = frame.read_data();
        self.store.lock().write(&data, page_id.extent())?;
        frame.set_dirty(false);
        Ok(())
    }
}
