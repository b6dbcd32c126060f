// https://wiki.osdev.org/Paging
//
// Two-level x86 page tables. The kernel owns the tables directly instead of
// addressing them through physical memory, so a page directory entry only
// carries the flags and the table itself lives in `PageManager::tables`.

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation for user addresses, which always sit below OFFSET.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{is_user_vaddr, page_offset, PhysAddr, VirtAddr, PAGE_FRAME_SIZE};
use alloc::{boxed::Box, vec::Vec};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

const PAGE_DIRECTORY_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageDirectoryEntry>();

#[repr(align(4096))]
pub struct PageDirectory(pub [PageDirectoryEntry; PAGE_DIRECTORY_LEN]);

impl Default for PageDirectory {
    fn default() -> Self {
        Self([PageDirectoryEntry::DEFAULT; PAGE_DIRECTORY_LEN])
    }
}

impl Deref for PageDirectory {
    type Target = [PageDirectoryEntry; PAGE_DIRECTORY_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageDirectory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageDirectoryEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bits(12..=31, rw)]
    page_table_address: u20,
}

const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// Physical address of the frame this entry points at.
    pub fn frame(&self) -> PhysAddr {
        (self.page_frame_address().value() as usize) << 12
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

fn split(virt: VirtAddr) -> (usize, usize) {
    let virt = VirtualAddress::new_with_raw_value(virt as u32);
    (
        virt.page_directory_index().value() as usize,
        virt.page_table_index().value() as usize,
    )
}

/// The user half of an address space's hardware translation structure.
pub struct PageManager {
    directory: Box<PageDirectory>,
    tables: Vec<Option<Box<PageTable>>>,
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(PAGE_DIRECTORY_LEN);
        tables.resize_with(PAGE_DIRECTORY_LEN, || None);
        Self {
            directory: Box::default(),
            tables,
        }
    }

    /// Maps the page containing `virt` to the frame at `phys`.
    ///
    /// Fails if `virt` is not a user address or is already mapped.
    #[must_use]
    pub fn map(&mut self, virt: VirtAddr, phys: PhysAddr, writable: bool) -> bool {
        if !is_user_vaddr(virt) {
            return false;
        }
        debug_assert_eq!(page_offset(phys), 0);

        let (pdi, pti) = split(virt);
        let table = self.tables[pdi].get_or_insert_with(Box::default);
        if table[pti].present() {
            return false;
        }

        self.directory[pdi] = self.directory[pdi]
            .with_present(true)
            .with_read_write(true)
            .with_user_supervisor(true);
        table[pti] = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new((phys >> 12) as u32));
        true
    }

    /// Removes the mapping for the page containing `virt`, if any.
    pub fn unmap(&mut self, virt: VirtAddr) {
        if let Some(entry) = self.entry_mut(virt) {
            *entry = PageTableEntry::DEFAULT;
        }
    }

    /// Returns the physical address `virt` translates to.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.entry(virt)
            .map(|entry| entry.frame() | page_offset(virt))
    }

    /// Returns the entry for `virt` if it is present.
    pub fn entry(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        if !is_user_vaddr(virt) {
            return None;
        }
        let (pdi, pti) = split(virt);
        let entry = self.tables[pdi].as_ref()?[pti];
        entry.present().then_some(entry)
    }

    fn entry_mut(&mut self, virt: VirtAddr) -> Option<&mut PageTableEntry> {
        if !is_user_vaddr(virt) {
            return None;
        }
        let (pdi, pti) = split(virt);
        let entry = &mut self.tables[pdi].as_mut()?[pti];
        entry.present().then_some(entry)
    }

    pub fn is_dirty(&self, virt: VirtAddr) -> bool {
        self.entry(virt).is_some_and(|entry| entry.dirty())
    }

    pub fn set_dirty(&mut self, virt: VirtAddr, dirty: bool) {
        if let Some(entry) = self.entry_mut(virt) {
            *entry = entry.with_dirty(dirty);
        }
    }

    pub fn is_accessed(&self, virt: VirtAddr) -> bool {
        self.entry(virt).is_some_and(|entry| entry.accessed())
    }

    pub fn set_accessed(&mut self, virt: VirtAddr, accessed: bool) {
        if let Some(entry) = self.entry_mut(virt) {
            *entry = entry.with_accessed(accessed);
        }
    }

    /// Clears the accessed bit, returning its previous value.
    pub fn take_accessed(&mut self, virt: VirtAddr) -> bool {
        let accessed = self.is_accessed(virt);
        self.set_accessed(virt, false);
        accessed
    }

    pub fn is_writable(&self, virt: VirtAddr) -> bool {
        self.entry(virt).is_some_and(|entry| entry.read_write())
    }
}
