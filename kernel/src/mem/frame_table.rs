//! The user frame pool.
//!
//! [`FrameTable`] holds the bookkeeping for every frame: whether it is
//! allocated, whether someone is working on it, and which page lives in it.
//! The contents live separately in [`PhysicalMemory`] so that the table's
//! lock is never held across a copy or an I/O.
//!
//! A frame moves through these states:
//!
//! ```text
//! free --allocate--> pinned --bind--> resident --pin--> pinned (being evicted)
//!   ^                  |                 |                 |
//!   +-------free-------+                 +--release--> free / orphaned
//! ```
//!
//! An allocated frame that is pinned belongs to whoever pinned it. A release
//! while an evictor holds the pin only clears the occupant; the evictor then
//! keeps the frame.

use crate::sync::mutex::Mutex;
use crate::swapping::page_replacement::{PageReplacementPolicy, Probe};
use alloc::boxed::Box;
use bitbybit::bitfield;
use log::trace;
use pagekit_shared::mem::{PhysAddr, VirtAddr, PAGE_FRAME_SIZE, USER_POOL_START};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Index of a frame in the user pool.
pub type FrameId = usize;

/// Identifies an address space.
pub type SpaceId = u32;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
}

/// The page a frame holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupant {
    pub space: SpaceId,
    pub va: VirtAddr,
}

pub struct FrameTable {
    core_map: Box<[CoreMapEntry]>,
    occupants: Box<[Option<Occupant>]>,
    frames_allocated: usize,
    /// Where the next-fit search for a free frame starts.
    position: usize,
    policy: Box<dyn PageReplacementPolicy>,
}

impl FrameTable {
    pub fn new(capacity: usize, policy: Box<dyn PageReplacementPolicy>) -> Self {
        Self {
            core_map: (0..capacity).map(|_| CoreMapEntry::DEFAULT).collect(),
            occupants: (0..capacity).map(|_| None).collect(),
            frames_allocated: 0,
            position: 0,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.core_map.len()
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    /// Takes a free frame, returning it pinned and without an occupant.
    pub fn allocate(&mut self) -> Option<FrameId> {
        let total = self.capacity();
        if self.frames_allocated == total {
            return None;
        }

        let frame = (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&i| !self.core_map[i].allocated())?;

        self.core_map[frame] = CoreMapEntry::DEFAULT.with_allocated(true).with_pinned(true);
        self.position = (frame + 1) % total;
        self.frames_allocated += 1;
        Some(frame)
    }

    /// Installs `occupant` in a pinned, empty frame and unpins it.
    pub fn bind(&mut self, frame: FrameId, occupant: Occupant) {
        let entry = self.core_map[frame];
        assert!(entry.allocated() && entry.pinned(), "binding unowned frame {frame}");
        assert!(
            self.occupants[frame].is_none(),
            "frame {frame} already holds {:?}",
            self.occupants[frame]
        );

        self.occupants[frame] = Some(occupant);
        self.core_map[frame] = entry.with_pinned(false);
        self.policy.frame_loaded(frame);
        trace!("frame {frame}: bound to {:#x} in space {}", occupant.va, occupant.space);
    }

    /// The occupant gives up `frame`. If an evictor has it pinned, the
    /// evictor keeps it; otherwise it is freed.
    pub fn release(&mut self, frame: FrameId, occupant: Occupant) {
        assert_eq!(
            self.occupants[frame],
            Some(occupant),
            "frame {frame} released by a page that does not hold it"
        );
        self.occupants[frame] = None;
        if !self.core_map[frame].pinned() {
            self.free(frame);
        }
    }

    /// Returns a frame with no occupant to the pool.
    pub fn free(&mut self, frame: FrameId) {
        assert!(self.core_map[frame].allocated(), "freeing free frame {frame}");
        assert!(self.occupants[frame].is_none(), "freeing occupied frame {frame}");

        self.core_map[frame] = CoreMapEntry::DEFAULT;
        self.frames_allocated -= 1;
        self.policy.frame_freed(frame);
    }

    /// Detaches the occupant of a frame the caller has pinned, leaving it
    /// pinned and empty.
    pub fn evict_occupant(&mut self, frame: FrameId) {
        debug_assert!(self.core_map[frame].pinned());
        self.occupants[frame] = None;
    }

    pub fn pin(&mut self, frame: FrameId) {
        let entry = self.core_map[frame];
        assert!(entry.allocated() && !entry.pinned(), "cannot pin frame {frame}");
        self.core_map[frame] = entry.with_pinned(true);
    }

    /// Drops a pin. A frame whose occupant left in the meantime is freed.
    pub fn unpin(&mut self, frame: FrameId) {
        let entry = self.core_map[frame];
        assert!(entry.pinned(), "frame {frame} is not pinned");
        if self.occupants[frame].is_none() {
            self.free(frame);
        } else {
            self.core_map[frame] = entry.with_pinned(false);
            self.policy.frame_loaded(frame);
        }
    }

    pub fn occupant(&self, frame: FrameId) -> Option<Occupant> {
        self.occupants[frame]
    }

    pub fn is_pinned(&self, frame: FrameId) -> bool {
        self.core_map[frame].pinned()
    }

    pub fn any_pinned(&self) -> bool {
        self.core_map.iter().any(|entry| entry.pinned())
    }

    /// Asks the replacement policy for a victim among the resident,
    /// unpinned frames. `probe` judges each candidate's occupant.
    pub fn select_victim(
        &mut self,
        mut probe: impl FnMut(FrameId, Occupant) -> Probe,
    ) -> Option<FrameId> {
        let Self {
            core_map,
            occupants,
            policy,
            ..
        } = self;

        policy.select_victim(core_map.len(), &mut |frame| {
            let entry = core_map[frame];
            match occupants[frame] {
                Some(occupant) if entry.allocated() && !entry.pinned() => probe(frame, occupant),
                _ => Probe::Unavailable,
            }
        })
    }
}

/// Most frames the user pool can hold: every frame number has to fit in a
/// page table entry's 20-bit frame address.
pub const MAX_FRAMES: usize = (1 << 20) - USER_POOL_START / PAGE_FRAME_SIZE;

/// Physical address of the start of `frame`.
pub const fn frame_to_phys(frame: FrameId) -> PhysAddr {
    USER_POOL_START + frame * PAGE_FRAME_SIZE
}

/// The frame containing physical address `phys`.
pub const fn phys_to_frame(phys: PhysAddr) -> FrameId {
    (phys - USER_POOL_START) / PAGE_FRAME_SIZE
}

/// The contents of one frame.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct PageFrame([u8; PAGE_FRAME_SIZE]);

impl PageFrame {
    pub fn bytes(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.as_bytes_mut()
    }
}

/// The user pool's memory. Each frame has its own lock, taken after any
/// address space lock and released before the frame table lock is taken.
pub struct PhysicalMemory {
    frames: Box<[Mutex<Box<PageFrame>>]>,
}

impl PhysicalMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: (0..capacity)
                .map(|_| Mutex::new(PageFrame::new_box_zeroed()))
                .collect(),
        }
    }

    pub fn frame(&self, frame: FrameId) -> &Mutex<Box<PageFrame>> {
        &self.frames[frame]
    }
}
