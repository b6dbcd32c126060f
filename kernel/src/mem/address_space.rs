use super::frame_table::SpaceId;
use super::spt::SupplementalPageTable;
use crate::sync::mutex::Mutex;
use alloc::{collections::BTreeMap, sync::Arc};
use pagekit_shared::mem::VirtAddr;
use pagekit_shared::paging::PageManager;

/// The user half of one process's memory.
pub struct AddressSpace {
    pub(super) id: SpaceId,
    pub(super) spt: SupplementalPageTable,
    pub(super) page_manager: PageManager,
    /// Start address and page count of each memory-mapped file region.
    pub(super) mappings: BTreeMap<VirtAddr, usize>,
}

/// Lock an address space before touching the frame table, and never wait
/// on a second address space while holding one.
pub type SharedSpace = Arc<Mutex<AddressSpace>>;

impl AddressSpace {
    pub(super) fn new(id: SpaceId) -> Self {
        Self {
            id,
            spt: SupplementalPageTable::new(),
            page_manager: PageManager::new(),
            mappings: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn page_manager(&self) -> &PageManager {
        &self.page_manager
    }

    /// Page count of the mapping starting at `addr`.
    pub fn mapping_at(&self, addr: VirtAddr) -> Option<usize> {
        self.mappings.get(&addr).copied()
    }

    /// Number of pages with a frame.
    pub fn resident_pages(&self) -> usize {
        self.spt.iter().filter(|page| page.is_resident()).count()
    }
}
