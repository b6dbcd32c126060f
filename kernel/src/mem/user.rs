//! User memory access.
//!
//! These walk the page tables the way the MMU would: a missing translation
//! raises a not-present fault, a write through a read-only entry is a
//! protection fault, and every access sets the entry's accessed bit (and
//! dirty bit for writes).

use super::address_space::AddressSpace;
use super::fault::PageFault;
use super::frame_table::{phys_to_frame, SpaceId};
use super::vm_error::VmError;
use super::Vm;
use core::cmp::min;
use pagekit_shared::mem::{page_offset, VirtAddr, OFFSET, PAGE_FRAME_SIZE};

impl Vm {
    /// Copies `buf.len()` bytes of user memory starting at `addr` into `buf`.
    pub fn read_user(
        &self,
        space: SpaceId,
        addr: VirtAddr,
        buf: &mut [u8],
        stack_pointer: VirtAddr,
    ) -> Result<(), VmError> {
        let shared = self.space(space)?;
        let mut space = shared.lock();
        self.access(&mut space, addr, buf.len(), false, stack_pointer, |page, at| {
            buf[at..at + page.len()].copy_from_slice(page);
        })
    }

    /// Copies `data` into user memory starting at `addr`.
    pub fn write_user(
        &self,
        space: SpaceId,
        addr: VirtAddr,
        data: &[u8],
        stack_pointer: VirtAddr,
    ) -> Result<(), VmError> {
        let shared = self.space(space)?;
        let mut space = shared.lock();
        self.access(&mut space, addr, data.len(), true, stack_pointer, |page, at| {
            page.copy_from_slice(&data[at..at + page.len()]);
        })
    }

    /// Calls `copy` with each page-sized piece of the range, as a slice of
    /// the frame holding it and its offset from `addr`.
    fn access(
        &self,
        space: &mut AddressSpace,
        addr: VirtAddr,
        len: usize,
        write: bool,
        stack_pointer: VirtAddr,
        mut copy: impl FnMut(&mut [u8], usize),
    ) -> Result<(), VmError> {
        let end = addr.checked_add(len).ok_or(VmError::InvalidAddress)?;
        if end > OFFSET {
            return Err(VmError::InvalidAddress);
        }

        let mut cursor = addr;
        while cursor < end {
            let chunk = min(end - cursor, PAGE_FRAME_SIZE - page_offset(cursor));
            let entry = loop {
                match space.page_manager.entry(cursor) {
                    Some(_) if write && !space.page_manager.is_writable(cursor) => {
                        return Err(VmError::ProtectionViolation);
                    }
                    Some(entry) => break entry,
                    None => {
                        let fault = PageFault {
                            addr: cursor,
                            user: true,
                            write,
                            not_present: true,
                            stack_pointer,
                        };
                        self.handle_fault_in(space, &fault)?;
                    }
                }
            };

            let offset = page_offset(cursor);
            {
                let mut memory = self.memory.frame(phys_to_frame(entry.frame())).lock();
                copy(&mut memory.bytes_mut()[offset..offset + chunk], cursor - addr);
            }
            space.page_manager.set_accessed(cursor, true);
            if write {
                space.page_manager.set_dirty(cursor, true);
            }
            cursor += chunk;
        }
        Ok(())
    }
}
