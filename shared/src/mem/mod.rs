use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x8000_0000;

/// The user stack grows down from just below the kernel.
pub const USER_STACK_TOP: usize = OFFSET;
pub const MAX_USER_STACK_SIZE: usize = MB;

/// A stack access lands strictly less than this many bytes below the stack
/// pointer. `pusha` touches 32 bytes below `esp` before moving it.
pub const STACK_GROWTH_LIMIT: usize = 33;

/// Physical address of the first frame of the user pool.
pub const USER_POOL_START: usize = 4 * MB;

/// Virtual address of a page.
pub type VirtAddr = usize;
/// Physical address of a frame.
pub type PhysAddr = usize;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

/// Kernel virtual address through which the kernel sees physical `phys`.
#[inline]
pub const fn phys_to_kernel(phys: PhysAddr) -> usize {
    phys + OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_down(0x2000), 0x2000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3001));
    }

    #[test]
    fn user_kernel_split() {
        assert!(is_user_vaddr(USER_STACK_TOP - 1));
        assert!(!is_user_vaddr(OFFSET));
        assert_eq!(phys_to_kernel(USER_POOL_START), OFFSET + 4 * MB);
    }
}
