//! Page fault resolution.

use super::address_space::AddressSpace;
use super::frame_table::SpaceId;
use super::page::{Initializer, Page, PageType};
use super::vm_error::VmError;
use super::Vm;
use bitbybit::bitfield;
use core::sync::atomic::Ordering;
use log::trace;
use pagekit_shared::mem::{is_user_vaddr, page_round_down, VirtAddr, PAGE_FRAME_SIZE};

/// The error code the processor pushes for a page fault.
#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    /// 0: the page was not present. 1: protection violation.
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    write: bool,
    #[bit(2, rw)]
    user: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// The faulting address, from `cr2`.
    pub addr: VirtAddr,
    /// Raised from user mode.
    pub user: bool,
    pub write: bool,
    /// The page was not mapped, as opposed to mapped without permission.
    pub not_present: bool,
    /// The user stack pointer at the time of the fault. For faults taken in
    /// the kernel, the one saved on entry from user mode.
    pub stack_pointer: VirtAddr,
}

impl PageFault {
    pub fn from_error_code(addr: VirtAddr, error_code: u32, stack_pointer: VirtAddr) -> Self {
        let code = PageFaultErrorCode::new_with_raw_value(error_code);
        Self {
            addr,
            user: code.user(),
            write: code.write(),
            not_present: !code.present(),
            stack_pointer,
        }
    }
}

impl Vm {
    /// Resolves `fault` in address space `space`. An error means the access
    /// was illegal or the page could not be brought in, and the faulting
    /// process must die.
    pub fn try_handle_fault(&self, space: SpaceId, fault: &PageFault) -> Result<(), VmError> {
        let shared = self.space(space)?;
        let mut space = shared.lock();
        self.handle_fault_in(&mut space, fault)
    }

    pub(super) fn handle_fault_in(
        &self,
        space: &mut AddressSpace,
        fault: &PageFault,
    ) -> Result<(), VmError> {
        let addr = fault.addr;
        if addr < PAGE_FRAME_SIZE || !is_user_vaddr(addr) {
            return Err(VmError::InvalidAddress);
        }
        if !fault.not_present {
            return Err(VmError::ProtectionViolation);
        }

        let va = page_round_down(addr);
        match space.spt.find(va) {
            Some(page) => {
                assert!(
                    !page.is_resident(),
                    "not-present fault at {addr:#x} on resident page"
                );
                if fault.write && !page.writable() {
                    return Err(VmError::ProtectionViolation);
                }
            }
            None => {
                if !self.is_stack_access(fault) {
                    return Err(VmError::Unmapped);
                }
                trace!("space {}: growing stack to {va:#x}", space.id);
                let page = Page::new_uninit(va, true, PageType::Anon, Initializer::Zeroed)?;
                self.register(space, page)?;
            }
        }

        self.claim_in(&mut [&mut *space], 0, va)?;
        self.counters.faults_handled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Whether `fault` touches the stack region strictly below the stack
    /// pointer and close enough to it to be a push.
    fn is_stack_access(&self, fault: &PageFault) -> bool {
        let top = self.config.stack_top;
        let floor = top.saturating_sub(self.config.max_stack_size);
        let addr = fault.addr;
        if addr >= top || addr < floor {
            return false;
        }
        addr < fault.stack_pointer
            && fault.stack_pointer - addr < self.config.stack_growth_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_error_code() {
        let fault = PageFault::from_error_code(0x1234, 0b110, 0x7000);
        assert!(fault.user && fault.write && fault.not_present);

        let fault = PageFault::from_error_code(0x1234, 0b001, 0x7000);
        assert!(!fault.user && !fault.write && !fault.not_present);
    }
}
