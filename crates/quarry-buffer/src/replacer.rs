//! Clock eviction policy for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;

/// Eviction state of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Frame holds a pinned page, or nothing the clock may take.
    Pinned,
    /// Recently used; survives one pass of the clock hand.
    Referenced,
    /// Taken on the next visit of the clock hand.
    Cold,
}

/// Second-chance (clock) replacement over the pool's frames.
///
/// The pool reports pin transitions: `access_and_pin` on every pin,
/// `set_evictable` when the last pin drops, `remove` when a page leaves
/// the pool. `evict` sweeps the clock hand across the frames, demoting a
/// recently used frame once and returning the first one found cold.
/// Pinned frames are never victims.
pub struct ClockReplacer {
    inner: Mutex<ClockState>,
}

struct ClockState {
    /// Eviction state per frame, indexed by frame id.
    slots: Vec<SlotState>,
    /// Clock hand position.
    hand: usize,
    /// Number of frames in `Referenced` or `Cold` state.
    evictable: usize,
}

impl ClockReplacer {
    /// Creates a replacer for `num_frames` frames, all pinned.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockState {
                slots: vec![SlotState::Pinned; num_frames],
                hand: 0,
                evictable: 0,
            }),
        }
    }

    /// Records an access that pinned the frame; pinned frames are not
    /// eviction candidates.
    pub fn access_and_pin(&self, frame_id: FrameId) {
        self.transition(frame_id, SlotState::Pinned);
    }

    /// Marks a frame evictable (last pin dropped) or pins it again.
    ///
    /// A newly evictable frame gets one pass of grace from the clock hand.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let state = if evictable {
            SlotState::Referenced
        } else {
            SlotState::Pinned
        };
        self.transition(frame_id, state);
    }

    /// Drops a frame from consideration after its page left the pool.
    pub fn remove(&self, frame_id: FrameId) {
        self.transition(frame_id, SlotState::Pinned);
    }

    /// Selects a victim frame, or None when every frame is pinned.
    ///
    /// The chosen frame is no longer a candidate; the pool re-registers it
    /// once a new page lands in it.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.evictable == 0 {
            return None;
        }

        // Two rotations suffice: the first spends the reference grace,
        // the second finds a cold frame.
        let num_frames = inner.slots.len();
        for _ in 0..2 * num_frames {
            let hand = inner.hand;
            inner.hand = (hand + 1) % num_frames;
            match inner.slots[hand] {
                SlotState::Pinned => {}
                SlotState::Referenced => inner.slots[hand] = SlotState::Cold,
                SlotState::Cold => {
                    inner.slots[hand] = SlotState::Pinned;
                    inner.evictable -= 1;
                    return Some(FrameId(hand as u32));
                }
            }
        }
        None
    }

    fn transition(&self, frame_id: FrameId, to: SlotState) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0 as usize;
        if idx >= inner.slots.len() {
            return;
        }
        let was = inner.slots[idx];
        inner.slots[idx] = to;
        if was == SlotState::Pinned && to != SlotState::Pinned {
            inner.evictable += 1;
        } else if was != SlotState::Pinned && to == SlotState::Pinned {
            inner.evictable -= 1;
        }
    }
}
