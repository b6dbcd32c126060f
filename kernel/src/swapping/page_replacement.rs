//! Victim selection for frame eviction.

use crate::mem::frame_table::FrameId;
use alloc::collections::VecDeque;

/// What the frame table reports about a candidate victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Free, pinned, or owned by an address space that is busy right now.
    Unavailable,
    /// Touched since the last probe. Probing cleared the reference bit.
    Referenced,
    /// Not touched since the last probe.
    Idle,
}

pub trait PageReplacementPolicy: Send {
    /// A page was bound to `frame`.
    fn frame_loaded(&mut self, _frame: FrameId) {}

    /// `frame` went back to the free pool.
    fn frame_freed(&mut self, _frame: FrameId) {}

    /// Picks a frame to evict among `0..frame_count`, or `None` if every
    /// frame is unavailable.
    fn select_victim(
        &mut self,
        frame_count: usize,
        probe: &mut dyn FnMut(FrameId) -> Probe,
    ) -> Option<FrameId>;
}

/// Second chance: the hand sweeps the frames in order, sparing (and
/// clearing) referenced frames once.
#[derive(Debug, Default)]
pub struct Clock {
    hand: usize,
}

impl PageReplacementPolicy for Clock {
    fn select_victim(
        &mut self,
        frame_count: usize,
        probe: &mut dyn FnMut(FrameId) -> Probe,
    ) -> Option<FrameId> {
        if frame_count == 0 {
            return None;
        }

        // Two sweeps: the first may only clear reference bits.
        for _ in 0..2 * frame_count {
            let frame = self.hand % frame_count;
            self.hand = (frame + 1) % frame_count;
            if probe(frame) == Probe::Idle {
                return Some(frame);
            }
        }
        None
    }
}

/// Evicts in load order, ignoring references.
#[derive(Debug, Default)]
pub struct Fifo {
    queue: VecDeque<FrameId>,
}

impl PageReplacementPolicy for Fifo {
    fn frame_loaded(&mut self, frame: FrameId) {
        if !self.queue.contains(&frame) {
            self.queue.push_back(frame);
        }
    }

    fn frame_freed(&mut self, frame: FrameId) {
        self.queue.retain(|&f| f != frame);
    }

    fn select_victim(
        &mut self,
        _frame_count: usize,
        probe: &mut dyn FnMut(FrameId) -> Probe,
    ) -> Option<FrameId> {
        for _ in 0..self.queue.len() {
            let frame = self.queue.pop_front()?;
            if probe(frame) != Probe::Unavailable {
                return Some(frame);
            }
            self.queue.push_back(frame);
        }
        None
    }
}
