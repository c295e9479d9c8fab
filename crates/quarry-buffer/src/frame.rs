//! Buffer frame management.

use parking_lot::RwLock;
use quarry_common::PageId;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Sentinel value indicating no page is loaded in the frame.
///
/// Matches `PageId::INVALID`, which is never a real extent.
const NO_PAGE: u64 = u64::MAX;

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in the buffer pool holding a single page.
///
/// Each frame contains the page bytes (one extent) plus the metadata the
/// pool needs: the resident page id, pin count, and dirty flag. Eviction
/// state is tracked by the replacer, not the frame.
pub struct BufferFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// The page currently stored in this frame (`NO_PAGE` = none).
    page_id: AtomicU64,
    /// Page data buffer, one extent long.
    data: RwLock<Box<[u8]>>,
    /// Number of users currently accessing this page.
    pin_count: AtomicU32,
    /// Whether the page has been modified since it was last written out.
    is_dirty: AtomicBool,
}

impl BufferFrame {
    /// Creates a new empty buffer frame with a `page_size`-byte buffer.
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(NO_PAGE),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID currently stored in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let raw = self.page_id.load(Ordering::Acquire);
        if raw == NO_PAGE {
            None
        } else {
            Some(PageId::from_u64(raw))
        }
    }

    /// Sets the page ID for this frame.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<PageId>) {
        let raw = match page_id {
            Some(pid) => pid.as_u64(),
            None => NO_PAGE,
        };
        self.page_id.store(raw, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count; returns the previous count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count; returns the new count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow protection: restore to 0
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Marks this frame as dirty or clean.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Reads the page data.
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Writes to the page data.
    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Resets the frame to empty state, zeroing the buffer.
    #[inline]
    pub fn reset(&self) {
        self.page_id.store(NO_PAGE, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        let mut data = self.data.write();
        data.fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}
