//! Demand-paged user memory.
//!
//! Lock order, outermost first:
//!
//! 1. the faulting address space (and, for fork, the child after the parent)
//! 2. the frame table, held briefly and never across a copy or an I/O
//! 3. the address space registry, held briefly
//! 4. other address spaces, only ever through `try_lock`
//! 5. a frame's memory
//! 6. the swap device or a file
//!
//! The swap slot set is a leaf lock of its own, taken only to hand out or
//! release a slot and never held across device I/O.

pub mod address_space;
pub mod fault;
pub mod frame_table;
pub mod page;
pub mod spt;
pub mod user;
pub mod vm_error;


use crate::block::BlockDevice;
use crate::swapping::page_replacement::{Clock, Fifo, PageReplacementPolicy, Probe};
use crate::swapping::SwapSpace;
use crate::sync::mutex::Mutex;
use crate::vfs::{self, FileRef};
use address_space::{AddressSpace, SharedSpace};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::cmp::min;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use frame_table::{
    frame_to_phys, FrameId, FrameTable, Occupant, PageFrame, PhysicalMemory, SpaceId, MAX_FRAMES,
};
use log::{debug, error, warn};
use once_cell::race::OnceBox;
use page::{FileSource, Initializer, Page, PageType};
use pagekit_shared::mem::{
    is_page_aligned, is_user_vaddr, page_round_down, PhysAddr, VirtAddr, MAX_USER_STACK_SIZE,
    OFFSET, PAGE_FRAME_SIZE, STACK_GROWTH_LIMIT, USER_STACK_TOP,
};
use pagekit_shared::paging::PageManager;
use vm_error::VmError;
use zerocopy::FromZeroes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Second chance.
    Clock,
    /// Oldest resident page first.
    Fifo,
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Frames in the user pool.
    pub frame_capacity: usize,
    /// The stack grows down from here.
    pub stack_top: VirtAddr,
    pub max_stack_size: usize,
    /// A stack access lands strictly below the stack pointer and less than
    /// this many bytes below it.
    pub stack_growth_limit: usize,
    pub eviction_policy: EvictionPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frame_capacity: 256,
            stack_top: USER_STACK_TOP,
            max_stack_size: MAX_USER_STACK_SIZE,
            stack_growth_limit: STACK_GROWTH_LIMIT,
            eviction_policy: EvictionPolicy::Clock,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub faults_handled: usize,
    pub evictions: usize,
    pub swap_ins: usize,
    pub swap_outs: usize,
    pub file_writebacks: usize,
}

#[derive(Default)]
struct Counters {
    faults_handled: AtomicUsize,
    evictions: AtomicUsize,
    file_writebacks: AtomicUsize,
}

pub struct Vm {
    config: VmConfig,
    frames: Mutex<FrameTable>,
    memory: PhysicalMemory,
    swap: SwapSpace,
    spaces: Mutex<BTreeMap<SpaceId, SharedSpace>>,
    next_space: AtomicU32,
    counters: Counters,
}

static VM: OnceBox<Vm> = OnceBox::new();

/// Sets up the global VM, swapping to `swap_device`. Later calls return the
/// existing instance and drop their arguments.
pub fn vm_init(config: VmConfig, swap_device: Box<dyn BlockDevice>) -> &'static Vm {
    if VM.get().is_some() {
        warn!("vm: already initialized");
    }
    VM.get_or_init(|| Box::new(Vm::new(config, swap_device)))
}

/// The global VM. Panics before [`vm_init`].
pub fn vm() -> &'static Vm {
    VM.get().expect("VM not initialized.")
}

impl Vm {
    pub fn new(config: VmConfig, swap_device: Box<dyn BlockDevice>) -> Self {
        assert!(config.frame_capacity > 0, "vm: empty frame pool");
        assert!(
            config.frame_capacity <= MAX_FRAMES,
            "vm: {} frames exceed the physical address space ({MAX_FRAMES} max)",
            config.frame_capacity
        );
        let policy: Box<dyn PageReplacementPolicy> = match config.eviction_policy {
            EvictionPolicy::Clock => Box::new(Clock::default()),
            EvictionPolicy::Fifo => Box::new(Fifo::default()),
        };
        let swap = SwapSpace::new(swap_device);
        debug!(
            "vm: {} frames, {} swap slots, {:?} eviction",
            config.frame_capacity,
            swap.slot_count(),
            config.eviction_policy
        );

        Self {
            frames: Mutex::new(FrameTable::new(config.frame_capacity, policy)),
            memory: PhysicalMemory::new(config.frame_capacity),
            swap,
            spaces: Mutex::new(BTreeMap::new()),
            next_space: AtomicU32::new(1),
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            faults_handled: self.counters.faults_handled.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            swap_ins: self.swap.pages_read(),
            swap_outs: self.swap.pages_written(),
            file_writebacks: self.counters.file_writebacks.load(Ordering::Relaxed),
        }
    }

    pub fn frames_in_use(&self) -> usize {
        self.frames.lock().frames_allocated()
    }

    pub fn free_swap_slots(&self) -> u32 {
        self.swap.free_slots()
    }

    // Address spaces ---------------------------------------------------------

    /// Creates an empty address space.
    pub fn create_space(&self) -> SpaceId {
        let id = self.next_space.fetch_add(1, Ordering::Relaxed);
        let space = Arc::new(Mutex::new(AddressSpace::new(id)));
        self.spaces.lock().insert(id, space);
        id
    }

    pub fn address_space(&self, id: SpaceId) -> Option<SharedSpace> {
        self.spaces.lock().get(&id).cloned()
    }

    fn space(&self, id: SpaceId) -> Result<SharedSpace, VmError> {
        self.address_space(id).ok_or(VmError::InvalidArgument)
    }

    /// Tears down an address space, writing back dirty file pages and
    /// releasing every frame and swap slot it holds.
    pub fn destroy_space(&self, id: SpaceId) {
        let Some(shared) = self.address_space(id) else {
            return;
        };
        {
            let mut space = shared.lock();
            self.kill_space(&mut space);
        }
        self.spaces.lock().remove(&id);
        debug!("space {id}: destroyed");
    }

    fn kill_space(&self, space: &mut AddressSpace) {
        let AddressSpace {
            id,
            spt,
            page_manager,
            mappings,
        } = space;
        for page in spt.drain() {
            self.discard(*id, page_manager, page);
        }
        mappings.clear();
    }

    /// Creates a child address space holding a copy of every page of
    /// `parent`. The copies share nothing with the originals.
    pub fn fork(&self, parent: SpaceId) -> Result<SpaceId, VmError> {
        let parent_shared = self.space(parent)?;
        let child = self.create_space();
        let child_shared = self.space(child)?;

        let result = {
            let mut parent = parent_shared.lock();
            let mut child = child_shared.lock();
            self.copy_spt(&mut child, &mut parent)
        };
        if let Err(err) = result {
            self.destroy_space(child);
            return Err(err);
        }
        debug!("space {parent}: forked into {child}");
        Ok(child)
    }

    fn copy_spt(&self, dst: &mut AddressSpace, src: &mut AddressSpace) -> Result<(), VmError> {
        dst.mappings = src.mappings.clone();
        let mut scratch = PageFrame::new_box_zeroed();

        for va in src.spt.addresses() {
            let Some(page) = src.spt.find(va) else {
                continue;
            };
            if let Some(copy) = page.duplicate_uninit() {
                assert!(dst.spt.insert(copy), "fork into populated space");
                continue;
            }

            let writable = page.writable();
            let copy = match page.file_source() {
                Some(source) => Page::new_file(
                    va,
                    writable,
                    FileSource {
                        file: vfs::reopen(&source.file),
                        ..source.clone()
                    },
                    page.sticky_dirty() || src.page_manager.is_dirty(va),
                ),
                None => Page::new_anon(va, writable),
            };
            assert!(dst.spt.insert(copy), "fork into populated space");

            // Snapshot the parent's contents before another frame is taken,
            // since taking one may evict them again.
            self.claim_in(&mut [&mut *src, &mut *dst], 0, va)?;
            let Some(frame) = src.spt.find(va).and_then(Page::frame) else {
                unreachable!("claimed page {va:#x} is not resident");
            };
            scratch
                .bytes_mut()
                .copy_from_slice(self.memory.frame(frame).lock().bytes());

            let frame = self.acquire_frame(&mut [&mut *src, &mut *dst])?;
            self.install(dst, va, frame, |_, buf| {
                buf.bytes_mut().copy_from_slice(scratch.bytes());
                Ok(())
            })?;
        }
        Ok(())
    }

    // Registration -----------------------------------------------------------

    fn register(&self, space: &mut AddressSpace, page: Page) -> Result<(), VmError> {
        let va = page.va();
        if va == 0 || !is_page_aligned(va) || !is_user_vaddr(va) {
            return Err(VmError::InvalidAddress);
        }
        if !space.spt.insert(page) {
            return Err(VmError::AlreadyMapped);
        }
        Ok(())
    }

    /// Registers a lazily initialized page of type `ty` at `va`. Nothing is
    /// loaded until the page is first claimed.
    pub fn alloc_page_with_initializer(
        &self,
        space: SpaceId,
        ty: PageType,
        va: VirtAddr,
        writable: bool,
        init: Initializer,
    ) -> Result<(), VmError> {
        let page = Page::new_uninit(va, writable, ty, init)?;
        let shared = self.space(space)?;
        let mut space = shared.lock();
        self.register(&mut space, page)
    }

    /// Registers a zero-filled page.
    pub fn alloc_page(
        &self,
        space: SpaceId,
        ty: PageType,
        va: VirtAddr,
        writable: bool,
    ) -> Result<(), VmError> {
        self.alloc_page_with_initializer(space, ty, va, writable, Initializer::Zeroed)
    }

    /// Registers an executable segment: `read_bytes` from `file` at `offset`
    /// followed by `zero_bytes` of zeros, starting at `upage`. Each page
    /// reads its own slice of the file when first touched.
    pub fn load_segment(
        &self,
        space: SpaceId,
        file: &FileRef,
        mut offset: u64,
        mut upage: VirtAddr,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        let length = read_bytes
            .checked_add(zero_bytes)
            .ok_or(VmError::InvalidArgument)?;
        if length % PAGE_FRAME_SIZE != 0
            || !is_page_aligned(upage)
            || offset % PAGE_FRAME_SIZE as u64 != 0
        {
            return Err(VmError::InvalidArgument);
        }
        let end = upage.checked_add(length).ok_or(VmError::InvalidAddress)?;
        if upage == 0 || end > OFFSET {
            return Err(VmError::InvalidAddress);
        }

        let shared = self.space(space)?;
        let mut space = shared.lock();
        if (upage..end)
            .step_by(PAGE_FRAME_SIZE)
            .any(|va| space.spt.find(va).is_some())
        {
            return Err(VmError::AlreadyMapped);
        }
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = min(read_bytes, PAGE_FRAME_SIZE);
            let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

            let source = FileSource {
                file: vfs::reopen(file),
                offset,
                read_bytes: page_read_bytes,
            };
            let page = Page::new_uninit(upage, writable, PageType::Anon, Initializer::FromFile(source))?;
            self.register(&mut space, page)?;

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            upage += PAGE_FRAME_SIZE;
            offset += page_read_bytes as u64;
        }
        Ok(())
    }

    /// Registers and loads the first stack page, returning the initial stack
    /// pointer.
    pub fn setup_stack(&self, space: SpaceId) -> Result<VirtAddr, VmError> {
        let va = self.config.stack_top - PAGE_FRAME_SIZE;
        let shared = self.space(space)?;
        let mut space = shared.lock();
        self.register(
            &mut space,
            Page::new_uninit(va, true, PageType::Anon, Initializer::Zeroed)?,
        )?;
        self.claim_in(&mut [&mut *space], 0, va)?;
        Ok(self.config.stack_top)
    }

    /// Unregisters the page containing `va`, writing it back first if it is
    /// a dirty file page.
    pub fn remove_page(&self, space: SpaceId, va: VirtAddr) -> Result<(), VmError> {
        let shared = self.space(space)?;
        let mut space = shared.lock();
        let page = space.spt.remove(va).ok_or(VmError::Unmapped)?;
        self.discard(space.id, &mut space.page_manager, page);
        Ok(())
    }

    /// Destroys `page`, which is no longer in its table.
    fn discard(&self, space: SpaceId, page_manager: &mut PageManager, mut page: Page) {
        let va = page.va();
        let result = match page.frame() {
            Some(frame) => {
                let hw_dirty = page_manager.is_dirty(va);
                if page.needs_write_back(hw_dirty) {
                    self.counters.file_writebacks.fetch_add(1, Ordering::Relaxed);
                }
                let memory = self.memory.frame(frame).lock();
                let result = page.destroy(Some((&**memory, hw_dirty)), &self.swap);
                drop(memory);

                page_manager.unmap(va);
                page.set_frame(None);
                self.frames.lock().release(frame, Occupant { space, va });
                result
            }
            None => page.destroy(None, &self.swap),
        };
        if let Err(err) = result {
            error!("space {space}: page {va:#x} lost changes: {err}");
        }
    }

    // Memory-mapped files ----------------------------------------------------

    /// Maps `length` bytes of `file` from `offset` at `addr`, one lazily
    /// loaded page per page of the range. Bytes past the end of the file read
    /// as zero and are never written back.
    pub fn mmap(
        &self,
        space: SpaceId,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &FileRef,
        offset: u64,
    ) -> Result<VirtAddr, VmError> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(VmError::InvalidAddress);
        }
        if length == 0 || offset % PAGE_FRAME_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument);
        }
        let end = addr.checked_add(length).ok_or(VmError::InvalidAddress)?;
        if end > OFFSET {
            return Err(VmError::InvalidAddress);
        }
        let file_len = file.len();
        if file_len == 0 {
            return Err(VmError::InvalidArgument);
        }

        let page_count = length.div_ceil(PAGE_FRAME_SIZE);
        let file_bytes = usize::try_from(file_len.saturating_sub(offset))
            .map_or(length, |remaining| min(remaining, length));

        let shared = self.space(space)?;
        let mut space = shared.lock();
        let pages = (0..page_count).map(|i| addr + i * PAGE_FRAME_SIZE);
        if pages.clone().any(|va| space.spt.find(va).is_some()) {
            return Err(VmError::AlreadyMapped);
        }

        for (i, va) in pages.enumerate() {
            let source = FileSource {
                file: vfs::reopen(file),
                offset: offset + (i * PAGE_FRAME_SIZE) as u64,
                read_bytes: min(file_bytes.saturating_sub(i * PAGE_FRAME_SIZE), PAGE_FRAME_SIZE),
            };
            let page = Page::new_uninit(va, writable, PageType::File, Initializer::FromFile(source))?;
            self.register(&mut space, page)?;
        }
        space.mappings.insert(addr, page_count);
        debug!("space {}: mapped {page_count} pages at {addr:#x}", space.id);
        Ok(addr)
    }

    /// Unmaps the region `mmap` returned `addr` for, writing back dirty
    /// pages.
    pub fn munmap(&self, space: SpaceId, addr: VirtAddr) -> Result<(), VmError> {
        let shared = self.space(space)?;
        let mut space = shared.lock();
        let page_count = space
            .mappings
            .remove(&addr)
            .ok_or(VmError::InvalidArgument)?;

        let AddressSpace {
            id,
            spt,
            page_manager,
            ..
        } = &mut *space;
        for va in (0..page_count).map(|i| addr + i * PAGE_FRAME_SIZE) {
            if let Some(page) = spt.remove(va) {
                self.discard(*id, page_manager, page);
            }
        }
        debug!("space {id}: unmapped {page_count} pages at {addr:#x}");
        Ok(())
    }

    // Queries ----------------------------------------------------------------

    /// The type of the page containing `va`. Uninitialized pages report the
    /// type they will become.
    pub fn page_get_type(&self, space: SpaceId, va: VirtAddr) -> Option<PageType> {
        let shared = self.address_space(space)?;
        let space = shared.lock();
        space.spt.find(va).map(Page::page_type)
    }

    /// Physical address of the frame `va` is mapped to. Does not fault pages
    /// in or touch accessed bits.
    pub fn inspect(&self, space: SpaceId, va: VirtAddr) -> Option<PhysAddr> {
        let shared = self.address_space(space)?;
        let space = shared.lock();
        space
            .page_manager
            .translate(va)
            .map(page_round_down)
    }

    // Claiming ---------------------------------------------------------------

    /// Makes the page containing `va` resident.
    pub fn claim_page(&self, space: SpaceId, va: VirtAddr) -> Result<(), VmError> {
        let shared = self.space(space)?;
        let mut space = shared.lock();
        self.claim_in(&mut [&mut *space], 0, va)
    }

    /// Claims `va` in `held[target]`. Every address space the caller has
    /// locked must be in `held`.
    fn claim_in(
        &self,
        held: &mut [&mut AddressSpace],
        target: usize,
        va: VirtAddr,
    ) -> Result<(), VmError> {
        let va = page_round_down(va);
        let page = held[target].spt.find(va).ok_or(VmError::Unmapped)?;
        if page.is_resident() {
            return Ok(());
        }

        let frame = self.acquire_frame(held)?;
        self.install(&mut *held[target], va, frame, |page, buf| {
            page.swap_in(buf, &self.swap)
        })
    }

    /// Maps `frame`, a pinned frame from [`Self::acquire_frame`], at `va` and
    /// fills it with `fill`. On failure the frame goes back to the pool.
    fn install(
        &self,
        space: &mut AddressSpace,
        va: VirtAddr,
        frame: FrameId,
        fill: impl FnOnce(&mut Page, &mut PageFrame) -> Result<(), VmError>,
    ) -> Result<(), VmError> {
        let AddressSpace {
            id,
            spt,
            page_manager,
            ..
        } = space;

        let Some(page) = spt.find_mut(va) else {
            self.frames.lock().free(frame);
            return Err(VmError::Unmapped);
        };
        if !page_manager.map(va, frame_to_phys(frame), page.writable()) {
            self.frames.lock().free(frame);
            return Err(VmError::AlreadyMapped);
        }

        let filled = fill(page, &mut self.memory.frame(frame).lock());
        if let Err(err) = filled {
            page_manager.unmap(va);
            self.frames.lock().free(frame);
            return Err(err);
        }

        page.set_frame(Some(frame));
        self.frames.lock().bind(frame, Occupant { space: *id, va });
        Ok(())
    }

    // Eviction ---------------------------------------------------------------

    /// Returns a pinned, empty frame, evicting a page if the pool is full.
    ///
    /// Panics if no frame can be produced: every frame is resident and none
    /// is in use by anyone who could let go of it.
    fn acquire_frame(&self, held: &mut [&mut AddressSpace]) -> Result<FrameId, VmError> {
        loop {
            let mut frames = self.frames.lock();
            if let Some(frame) = frames.allocate() {
                return Ok(frame);
            }

            let mut contended = false;
            let spaces = self.spaces.lock();
            let victim = frames.select_victim(|_, occupant| {
                Self::probe(held, &spaces, occupant, &mut contended)
            });
            drop(spaces);
            let Some(victim) = victim else {
                assert!(
                    contended || frames.any_pinned(),
                    "out of frames: all {} frames are unavailable",
                    frames.capacity()
                );
                drop(frames);
                core::hint::spin_loop();
                continue;
            };

            frames.pin(victim);
            let occupant = frames.occupant(victim);
            drop(frames);

            if self.evict(held, victim, occupant)? {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                return Ok(victim);
            }
        }
    }

    /// Reports on a candidate victim, clearing its accessed bit.
    fn probe(
        held: &mut [&mut AddressSpace],
        spaces: &BTreeMap<SpaceId, SharedSpace>,
        occupant: Occupant,
        contended: &mut bool,
    ) -> Probe {
        let referenced = |space: &mut AddressSpace| {
            if space.page_manager.take_accessed(occupant.va) {
                Probe::Referenced
            } else {
                Probe::Idle
            }
        };

        if let Some(space) = held.iter_mut().find(|space| space.id == occupant.space) {
            return referenced(&mut **space);
        }
        match spaces.get(&occupant.space) {
            // Orphaned; free to take.
            None => Probe::Idle,
            Some(shared) => match shared.try_lock() {
                Some(mut space) => referenced(&mut *space),
                None => {
                    *contended = true;
                    Probe::Unavailable
                }
            },
        }
    }

    /// Empties `victim`, which the caller has pinned. Returns `false` if the
    /// owner is busy and the frame was let go.
    fn evict(
        &self,
        held: &mut [&mut AddressSpace],
        victim: FrameId,
        occupant: Option<Occupant>,
    ) -> Result<bool, VmError> {
        let Some(occupant) = occupant else {
            return Ok(true);
        };

        if let Some(space) = held.iter_mut().find(|space| space.id == occupant.space) {
            return self
                .swap_out_victim(&mut **space, victim, occupant)
                .map(|()| true);
        }

        let shared = self.address_space(occupant.space);
        let Some(shared) = shared else {
            warn!(
                "frame {victim}: reclaiming page {:#x} of vanished space {}",
                occupant.va, occupant.space
            );
            self.frames.lock().evict_occupant(victim);
            return Ok(true);
        };
        let Some(mut space) = shared.try_lock() else {
            self.frames.lock().unpin(victim);
            return Ok(false);
        };
        self.swap_out_victim(&mut space, victim, occupant)
            .map(|()| true)
    }

    fn swap_out_victim(
        &self,
        space: &mut AddressSpace,
        victim: FrameId,
        occupant: Occupant,
    ) -> Result<(), VmError> {
        // The owner may have let go while the frame was pinned.
        if self.frames.lock().occupant(victim) != Some(occupant) {
            return Ok(());
        }

        let va = occupant.va;
        let hw_dirty = space.page_manager.is_dirty(va);
        let Some(page) = space.spt.find_mut(va) else {
            panic!("frame {victim} holds unregistered page {va:#x}");
        };
        let writes_back = page.needs_write_back(hw_dirty);

        let saved = page.swap_out(&self.memory.frame(victim).lock(), hw_dirty, &self.swap);
        if let Err(err) = saved {
            self.frames.lock().unpin(victim);
            return Err(err);
        }
        if writes_back {
            self.counters.file_writebacks.fetch_add(1, Ordering::Relaxed);
        }

        page.set_frame(None);
        space.page_manager.unmap(va);
        self.frames.lock().evict_occupant(victim);
        debug!("frame {victim}: evicted {va:#x} of space {}", space.id);
        Ok(())
    }
}
