//! Swap space for anonymous pages.
//!
//! The swap device is split into page-sized slots of `SECTORS_PER_PAGE`
//! consecutive sectors. Slot `i` starts at sector `i * SECTORS_PER_PAGE`.

mod free_set;
pub mod page_replacement;

use crate::block::{BlockDevice, BlockError, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};
use free_set::FreeSet;
use log::trace;
use pagekit_shared::mem::PAGE_FRAME_SIZE;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// A page-sized region of the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub fn index(self) -> u32 {
        self.0
    }

    fn sector(self, chunk: usize) -> BlockSector {
        // Fits: slots are counted from a BlockSector-sized device.
        #[allow(clippy::cast_possible_truncation)]
        let chunk = chunk as BlockSector;
        self.0 * SECTORS_PER_PAGE as BlockSector + chunk
    }
}

/// Slot bookkeeping and device transfers are locked separately, so taking
/// or releasing a slot never waits for another page's I/O.
pub struct SwapSpace {
    device: Mutex<Box<dyn BlockDevice>>,
    slots: Mutex<FreeSet>,
    slot_count: u32,
    pages_read: AtomicUsize,
    pages_written: AtomicUsize,
}

impl SwapSpace {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slot_count = device.size() / SECTORS_PER_PAGE as BlockSector;
        Self {
            device: Mutex::new(device),
            slots: Mutex::new(FreeSet::new_all_free(slot_count)),
            slot_count,
            pages_read: AtomicUsize::new(0),
            pages_written: AtomicUsize::new(0),
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn free_slots(&self) -> u32 {
        self.slots.lock().free_count()
    }

    pub fn pages_read(&self) -> usize {
        self.pages_read.load(Ordering::Relaxed)
    }

    pub fn pages_written(&self) -> usize {
        self.pages_written.load(Ordering::Relaxed)
    }

    /// Writes `page` to a fresh slot.
    ///
    /// Panics if the swap device is full. On a device error the slot is
    /// released again.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot, BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);

        let Some(index) = self.slots.lock().allocate() else {
            panic!("swap space exhausted ({} slots)", self.slot_count);
        };
        let slot = SwapSlot(index);

        let written = {
            let mut device = self.device.lock();
            page.chunks_exact(BLOCK_SECTOR_SIZE)
                .enumerate()
                .try_for_each(|(i, chunk)| device.write(slot.sector(i), chunk))
        };
        if let Err(err) = written {
            self.slots.lock().free(index);
            return Err(err);
        }
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        trace!("swap: wrote slot {index}");
        Ok(slot)
    }

    /// Reads `slot` into `page` and frees the slot.
    ///
    /// On a device error the slot stays allocated, still holding the page.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        assert!(
            !self.slots.lock().is_free(slot.0),
            "swap in from free slot {}",
            slot.0
        );

        {
            let mut device = self.device.lock();
            for (i, chunk) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
                device.read(slot.sector(i), chunk)?;
            }
        }
        self.slots.lock().free(slot.0);
        self.pages_read.fetch_add(1, Ordering::Relaxed);
        trace!("swap: read slot {}", slot.0);
        Ok(())
    }

    /// Discards the contents of `slot`.
    pub fn free(&self, slot: SwapSlot) {
        self.slots.lock().free(slot.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::BrokenDisk;
    use crate::block::MemDisk;
    use alloc::{vec, vec::Vec};

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_FRAME_SIZE]
    }

    #[test]
    fn round_trip_frees_slot() {
        let swap = SwapSpace::new(Box::new(MemDisk::new(4 * SECTORS_PER_PAGE as u32)));
        assert_eq!(swap.slot_count(), 4);

        let mut page = page_of(0);
        page[0] = 1;
        page[PAGE_FRAME_SIZE - 1] = 2;
        let slot = swap.swap_out(&page).unwrap();
        assert_eq!(swap.free_slots(), 3);

        let mut back = page_of(0xee);
        swap.swap_in(slot, &mut back).unwrap();
        assert_eq!(back, page);
        assert_eq!(swap.free_slots(), 4);
    }

    #[test]
    fn slots_do_not_overlap() {
        let swap = SwapSpace::new(Box::new(MemDisk::new(2 * SECTORS_PER_PAGE as u32)));
        let a = swap.swap_out(&page_of(0xaa)).unwrap();
        let b = swap.swap_out(&page_of(0xbb)).unwrap();
        assert_ne!(a, b);

        let mut buf = page_of(0);
        swap.swap_in(a, &mut buf).unwrap();
        assert_eq!(buf, page_of(0xaa));
        swap.swap_in(b, &mut buf).unwrap();
        assert_eq!(buf, page_of(0xbb));
    }

    #[test]
    #[should_panic(expected = "swap space exhausted")]
    fn full_swap_panics() {
        let swap = SwapSpace::new(Box::new(MemDisk::new(SECTORS_PER_PAGE as u32)));
        swap.swap_out(&page_of(1)).unwrap();
        let _ = swap.swap_out(&page_of(2));
    }

    #[test]
    fn write_error_releases_slot() {
        let swap = SwapSpace::new(Box::new(BrokenDisk(SECTORS_PER_PAGE as u32)));
        assert_eq!(swap.swap_out(&page_of(1)), Err(BlockError::WriteError));
        assert_eq!(swap.free_slots(), 1);
        assert_eq!(swap.pages_written(), 0);
    }

    #[test]
    fn slot_bookkeeping_does_not_wait_for_the_device() {
        let swap = SwapSpace::new(Box::new(MemDisk::new(2 * SECTORS_PER_PAGE as u32)));
        let slot = swap.swap_out(&page_of(3)).unwrap();

        let device = swap.device.lock();
        assert_eq!(swap.free_slots(), 1);
        swap.free(slot);
        assert_eq!(swap.free_slots(), 2);
        assert!(swap.slots.try_lock().is_some());
        drop(device);
    }

    #[test]
    fn concurrent_transfers_keep_pages_apart() {
        let swap = SwapSpace::new(Box::new(MemDisk::new(8 * SECTORS_PER_PAGE as u32)));
        std::thread::scope(|s| {
            for t in 0..4u8 {
                let swap = &swap;
                s.spawn(move || {
                    for round in 0..16u8 {
                        let byte = t * 16 + round;
                        let slot = swap.swap_out(&page_of(byte)).unwrap();
                        let mut back = page_of(0);
                        swap.swap_in(slot, &mut back).unwrap();
                        assert_eq!(back, page_of(byte));
                    }
                });
            }
        });
        assert_eq!(swap.free_slots(), 8);
        assert_eq!(swap.pages_written(), 64);
        assert_eq!(swap.pages_read(), 64);
    }
}
