//! Supplemental page table.
//!
//! Descriptors live in a slab owned by the table. The hash index only holds
//! `(address, slot)` handles into it, keyed by the page-aligned address.

use super::page::Page;
use alloc::vec::Vec;
use pagekit_shared::hash::{hash_bytes, HashIndex};
use pagekit_shared::mem::{page_round_down, VirtAddr};

#[derive(Debug, Clone, Copy)]
struct PageHandle {
    va: VirtAddr,
    slot: usize,
}

fn page_hash(handle: &PageHandle, _aux: &()) -> u64 {
    hash_bytes(&handle.va.to_ne_bytes())
}

fn page_less(a: &PageHandle, b: &PageHandle, _aux: &()) -> bool {
    a.va < b.va
}

/// Looks up by address only; the slot is ignored by hash and comparison.
fn probe(va: VirtAddr) -> PageHandle {
    PageHandle {
        va: page_round_down(va),
        slot: usize::MAX,
    }
}

pub struct SupplementalPageTable {
    index: HashIndex<PageHandle>,
    pages: Vec<Option<Page>>,
    free_slots: Vec<usize>,
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        let index = HashIndex::try_new(page_hash, page_less, ())
            .unwrap_or_else(|err| panic!("supplemental page table: {err}"));
        Self {
            index,
            pages: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns the page containing `va`.
    pub fn find(&self, va: VirtAddr) -> Option<&Page> {
        let handle = self.index.find(&probe(va))?;
        self.pages[handle.slot].as_ref()
    }

    pub fn find_mut(&mut self, va: VirtAddr) -> Option<&mut Page> {
        let slot = self.index.find(&probe(va))?.slot;
        self.pages[slot].as_mut()
    }

    /// Adds `page`. Fails, leaving the table as it was, if a page is already
    /// registered at its address.
    #[must_use]
    pub fn insert(&mut self, page: Page) -> bool {
        let va = page.va();
        debug_assert_eq!(va, page_round_down(va));
        if self.index.find(&probe(va)).is_some() {
            return false;
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.pages[slot] = Some(page);
                slot
            }
            None => {
                self.pages.push(Some(page));
                self.pages.len() - 1
            }
        };
        let previous = self.index.insert(PageHandle { va, slot });
        assert!(previous.is_none(), "duplicate page {va:#x} in index");
        true
    }

    /// Unregisters the page containing `va` and hands it back. Destroying it
    /// is up to the caller.
    pub fn remove(&mut self, va: VirtAddr) -> Option<Page> {
        let handle = self.index.delete(&probe(va))?;
        let page = self.pages[handle.slot].take();
        self.free_slots.push(handle.slot);
        page
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.index
            .iter()
            .filter_map(|handle| self.pages[handle.slot].as_ref())
    }

    /// Addresses of every registered page, sorted.
    pub fn addresses(&self) -> Vec<VirtAddr> {
        let mut vas: Vec<_> = self.index.iter().map(|handle| handle.va).collect();
        vas.sort_unstable();
        vas
    }

    /// Unregisters every page and hands them all back.
    pub fn drain(&mut self) -> Vec<Page> {
        let mut drained = Vec::with_capacity(self.len());
        let pages = &mut self.pages;
        self.index.clear(|handle| {
            if let Some(page) = pages[handle.slot].take() {
                drained.push(page);
            }
        });
        self.pages.clear();
        self.free_slots.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagekit_shared::mem::PAGE_FRAME_SIZE;

    #[test]
    fn finds_by_any_address_in_page() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.insert(Page::new_anon(0x4000, true)));
        assert_eq!(spt.find(0x4abc).map(Page::va), Some(0x4000));
        assert!(spt.find(0x5000).is_none());
    }

    #[test]
    fn distinct_addresses_stay_distinct() {
        let mut spt = SupplementalPageTable::new();
        for i in 0..300 {
            assert!(spt.insert(Page::new_anon(0x1000_0000 + i * PAGE_FRAME_SIZE, i % 2 == 0)));
        }
        for i in 0..300 {
            let page = spt.find(0x1000_0000 + i * PAGE_FRAME_SIZE).unwrap();
            assert_eq!(page.va(), 0x1000_0000 + i * PAGE_FRAME_SIZE);
            assert_eq!(page.writable(), i % 2 == 0);
        }
        assert_eq!(spt.len(), 300);
        assert_eq!(spt.iter().count(), 300);
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.insert(Page::new_anon(0x8000, true)));
        assert!(!spt.insert(Page::new_anon(0x8000, false)));
        assert!(spt.find(0x8000).unwrap().writable());
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn remove_then_reuse_slot() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.insert(Page::new_anon(0x1000, true)));
        assert!(spt.insert(Page::new_anon(0x2000, true)));
        assert_eq!(spt.remove(0x1000).map(|p| p.va()), Some(0x1000));
        assert!(spt.remove(0x1000).is_none());

        assert!(spt.insert(Page::new_anon(0x3000, false)));
        assert_eq!(spt.addresses(), [0x2000, 0x3000]);
        assert!(!spt.find(0x3000).unwrap().writable());
    }

    #[test]
    fn drain_empties_table() {
        let mut spt = SupplementalPageTable::new();
        for va in [0x1000, 0x2000, 0x3000] {
            assert!(spt.insert(Page::new_anon(va, true)));
        }
        let mut drained: Vec<_> = spt.drain().iter().map(Page::va).collect();
        drained.sort_unstable();
        assert_eq!(drained, [0x1000, 0x2000, 0x3000]);
        assert!(spt.is_empty());
        assert!(spt.find(0x1000).is_none());
    }
}
