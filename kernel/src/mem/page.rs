//! Page descriptors and their backing kinds.
//!
//! Every registered user page starts out [`PageKind::Uninit`], carrying what
//! it will become and how to fill it. The first claim runs the initializer
//! and turns it into an anonymous or file-backed page for good.

use super::frame_table::{FrameId, PageFrame};
use super::vm_error::VmError;
use crate::swapping::{SwapSlot, SwapSpace};
use crate::vfs::{self, FileRef};
use alloc::sync::Arc;
use core::fmt;
use log::trace;
use pagekit_shared::mem::VirtAddr;

/// What a page is, or will be once it is first touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Backed by swap.
    Anon,
    /// Backed by a file, written back when dirty.
    File,
}

/// A slice of a file backing one page.
#[derive(Clone)]
pub struct FileSource {
    pub file: FileRef,
    pub offset: u64,
    /// Bytes taken from the file. The rest of the page is zero.
    pub read_bytes: usize,
}

impl FileSource {
    /// Reads the slice into `buf` and zeroes the rest of the page.
    ///
    /// A file that shrank since the page was registered reads as zeros past
    /// its end.
    fn load(&self, buf: &mut [u8]) -> Result<(), VmError> {
        let read = self.file.read_at(self.offset, &mut buf[..self.read_bytes])?;
        buf[read..].fill(0);
        Ok(())
    }

    /// Writes the slice back. Bytes past `read_bytes` never reach the file,
    /// so a page wholly past the end of the file writes nothing.
    fn write_back(&self, buf: &[u8]) -> Result<(), VmError> {
        if self.read_bytes == 0 {
            return Ok(());
        }
        let written = self.file.write_at(self.offset, &buf[..self.read_bytes])?;
        if written != self.read_bytes {
            return Err(vfs::Error::NoSpace.into());
        }
        Ok(())
    }
}

/// Custom page initializer. The page is zeroed before it runs.
pub type InitFn = dyn Fn(&mut [u8]) -> Result<(), VmError> + Send + Sync;

/// How an uninitialized page gets its first contents.
#[derive(Clone)]
pub enum Initializer {
    Zeroed,
    FromFile(FileSource),
    With(Arc<InitFn>),
}

impl Initializer {
    fn run(&self, buf: &mut [u8]) -> Result<(), VmError> {
        match self {
            Self::Zeroed => {
                buf.fill(0);
                Ok(())
            }
            Self::FromFile(source) => source.load(buf),
            Self::With(init) => {
                buf.fill(0);
                init(buf)
            }
        }
    }
}

pub struct UninitPage {
    target: PageType,
    init: Initializer,
}

#[derive(Default)]
pub struct AnonPage {
    /// Where the contents went on eviction. A page that was never evicted
    /// has no slot and reads as zeros.
    slot: Option<SwapSlot>,
}

pub struct FilePage {
    source: FileSource,
    /// Modified since the last write-back, beyond what the page table entry
    /// records.
    dirty: bool,
}

pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

pub struct Page {
    va: VirtAddr,
    writable: bool,
    frame: Option<FrameId>,
    kind: PageKind,
}

impl Page {
    /// An uninitialized page at page-aligned `va`.
    ///
    /// File pages must be initialized from their file.
    pub fn new_uninit(
        va: VirtAddr,
        writable: bool,
        target: PageType,
        init: Initializer,
    ) -> Result<Self, VmError> {
        if target == PageType::File && !matches!(init, Initializer::FromFile(_)) {
            return Err(VmError::InvalidArgument);
        }
        Ok(Self {
            va,
            writable,
            frame: None,
            kind: PageKind::Uninit(UninitPage { target, init }),
        })
    }

    /// An initialized anonymous page with no contents yet.
    pub fn new_anon(va: VirtAddr, writable: bool) -> Self {
        Self {
            va,
            writable,
            frame: None,
            kind: PageKind::Anon(AnonPage::default()),
        }
    }

    /// An initialized file page whose contents will be supplied by the
    /// caller. `dirty` carries over modifications not yet written back.
    pub fn new_file(va: VirtAddr, writable: bool, source: FileSource, dirty: bool) -> Self {
        Self {
            va,
            writable,
            frame: None,
            kind: PageKind::File(FilePage { source, dirty }),
        }
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn set_frame(&mut self, frame: Option<FrameId>) {
        self.frame = frame;
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    /// The page's type. Uninitialized pages report what they will become.
    pub fn page_type(&self) -> PageType {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.target,
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    /// The backing file slice, for file pages and pages that will become one.
    pub fn file_source(&self) -> Option<&FileSource> {
        match &self.kind {
            PageKind::Uninit(UninitPage {
                init: Initializer::FromFile(source),
                target: PageType::File,
            }) => Some(source),
            PageKind::File(file) => Some(&file.source),
            _ => None,
        }
    }

    /// Whether evicting or destroying the resident page writes to its file.
    pub fn needs_write_back(&self, hw_dirty: bool) -> bool {
        match &self.kind {
            PageKind::File(file) => self.writable && (file.dirty || hw_dirty),
            _ => false,
        }
    }

    /// Whether the page has modifications the page table no longer shows.
    pub fn sticky_dirty(&self) -> bool {
        matches!(&self.kind, PageKind::File(FilePage { dirty: true, .. }))
    }

    /// A descriptor for the same registration in another address space, if
    /// it can be made without the contents. Initialized pages need their
    /// contents copied, so they return `None`.
    pub fn duplicate_uninit(&self) -> Option<Page> {
        let PageKind::Uninit(uninit) = &self.kind else {
            return None;
        };
        Some(Page {
            va: self.va,
            writable: self.writable,
            frame: None,
            kind: PageKind::Uninit(UninitPage {
                target: uninit.target,
                init: match &uninit.init {
                    Initializer::FromFile(source) => Initializer::FromFile(FileSource {
                        file: vfs::reopen(&source.file),
                        ..source.clone()
                    }),
                    init => init.clone(),
                },
            }),
        })
    }

    /// Fills `frame` with the page's contents.
    pub fn swap_in(&mut self, frame: &mut PageFrame, swap: &SwapSpace) -> Result<(), VmError> {
        let buf = frame.bytes_mut();
        match &mut self.kind {
            PageKind::Uninit(uninit) => {
                uninit.init.run(buf)?;
                trace!("page {:#x}: initialized as {:?}", self.va, uninit.target);
                self.kind = match (uninit.target, &uninit.init) {
                    (PageType::File, Initializer::FromFile(source)) => PageKind::File(FilePage {
                        source: source.clone(),
                        dirty: false,
                    }),
                    (PageType::File, _) => unreachable!("file page without a file"),
                    (PageType::Anon, _) => PageKind::Anon(AnonPage::default()),
                };
                Ok(())
            }
            PageKind::Anon(anon) => match anon.slot {
                Some(slot) => {
                    swap.swap_in(slot, buf)?;
                    anon.slot = None;
                    Ok(())
                }
                None => {
                    buf.fill(0);
                    Ok(())
                }
            },
            PageKind::File(file) => file.source.load(buf),
        }
    }

    /// Saves the contents of `frame` so it can be reused. `hw_dirty` is the
    /// page table's dirty bit for the page.
    pub fn swap_out(
        &mut self,
        frame: &PageFrame,
        hw_dirty: bool,
        swap: &SwapSpace,
    ) -> Result<(), VmError> {
        match &mut self.kind {
            PageKind::Uninit(_) => unreachable!("uninitialized page {:#x} is resident", self.va),
            PageKind::Anon(anon) => {
                debug_assert!(anon.slot.is_none());
                anon.slot = Some(swap.swap_out(frame.bytes())?);
                Ok(())
            }
            PageKind::File(file) => {
                if self.writable && (file.dirty || hw_dirty) {
                    file.source.write_back(frame.bytes())?;
                    trace!("page {:#x}: wrote back {} bytes", self.va, file.source.read_bytes);
                }
                file.dirty = false;
                Ok(())
            }
        }
    }

    /// Releases the backing store. A resident dirty file page is written
    /// back first, from `resident`'s frame.
    pub fn destroy(
        &mut self,
        resident: Option<(&PageFrame, bool)>,
        swap: &SwapSpace,
    ) -> Result<(), VmError> {
        match &mut self.kind {
            PageKind::Uninit(_) => Ok(()),
            PageKind::Anon(anon) => {
                if let Some(slot) = anon.slot.take() {
                    swap.free(slot);
                }
                Ok(())
            }
            PageKind::File(file) => match resident {
                Some((frame, hw_dirty)) if self.writable && (file.dirty || hw_dirty) => {
                    file.dirty = false;
                    file.source.write_back(frame.bytes())
                }
                _ => Ok(()),
            },
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("va", &format_args!("{:#x}", self.va))
            .field("writable", &self.writable)
            .field("frame", &self.frame)
            .field("type", &self.page_type())
            .field("uninit", &matches!(self.kind, PageKind::Uninit(_)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;
    use crate::swapping::SECTORS_PER_PAGE;
    use crate::vfs::tempfs::TempFile;
    use crate::vfs::File;
    use alloc::boxed::Box;
    use zerocopy::FromZeroes;

    fn swap() -> SwapSpace {
        SwapSpace::new(Box::new(MemDisk::new(4 * SECTORS_PER_PAGE as u32)))
    }

    #[test]
    fn file_type_needs_file_initializer() {
        assert_eq!(
            Page::new_uninit(0x1000, true, PageType::File, Initializer::Zeroed).err(),
            Some(VmError::InvalidArgument)
        );
    }

    #[test]
    fn uninit_becomes_target_type() {
        let swap = swap();
        let mut frame = PageFrame::new_box_zeroed();
        let init: Arc<InitFn> = Arc::new(|buf: &mut [u8]| {
            buf[0] = 9;
            Ok::<(), VmError>(())
        });
        let mut page = Page::new_uninit(0x1000, true, PageType::Anon, Initializer::With(init)).unwrap();
        assert_eq!(page.page_type(), PageType::Anon);

        page.swap_in(&mut frame, &swap).unwrap();
        assert!(matches!(page.kind(), PageKind::Anon(_)));
        assert_eq!(frame.bytes()[0], 9);
    }

    #[test]
    fn anon_swap_round_trip() {
        let swap = swap();
        let mut frame = PageFrame::new_box_zeroed();
        let mut page = Page::new_anon(0x2000, true);

        page.swap_in(&mut frame, &swap).unwrap();
        frame.bytes_mut()[100] = 0x5a;
        page.swap_out(&frame, true, &swap).unwrap();
        assert_eq!(swap.free_slots(), 3);

        let mut other = PageFrame::new_box_zeroed();
        page.swap_in(&mut other, &swap).unwrap();
        assert_eq!(other.bytes()[100], 0x5a);
        assert_eq!(swap.free_slots(), 4);
    }

    #[test]
    fn destroy_releases_swap_slot() {
        let swap = swap();
        let frame = PageFrame::new_box_zeroed();
        let mut page = Page::new_anon(0x2000, true);
        page.swap_out(&frame, false, &swap).unwrap();
        page.destroy(None, &swap).unwrap();
        assert_eq!(swap.free_slots(), 4);
    }

    #[test]
    fn file_page_tail_is_zero_and_never_written() {
        let swap = swap();
        let file = Arc::new(TempFile::with_contents(&[1; 10]));
        let source = FileSource {
            file: file.clone(),
            offset: 4,
            read_bytes: 6,
        };
        let mut page = Page::new_uninit(0x3000, true, PageType::File, Initializer::FromFile(source)).unwrap();

        let mut frame = PageFrame::new_box_zeroed();
        frame.bytes_mut().fill(0xff);
        page.swap_in(&mut frame, &swap).unwrap();
        assert_eq!(&frame.bytes()[..7], &[1, 1, 1, 1, 1, 1, 0]);

        frame.bytes_mut()[0] = 7;
        frame.bytes_mut()[8] = 7;
        page.swap_out(&frame, true, &swap).unwrap();
        assert_eq!(file.contents(), [1, 1, 1, 1, 7, 1, 1, 1, 1, 1]);
        assert_eq!(file.len(), 10);
    }

    #[test]
    fn clean_or_read_only_file_pages_are_not_written() {
        let swap = swap();
        let file = Arc::new(TempFile::with_contents(&[1; 4]));
        let source = FileSource {
            file: file.clone(),
            offset: 0,
            read_bytes: 4,
        };
        let mut frame = PageFrame::new_box_zeroed();

        let mut clean = Page::new_file(0x1000, true, source.clone(), false);
        clean.swap_out(&frame, false, &swap).unwrap();
        let mut read_only = Page::new_file(0x2000, false, source, true);
        read_only.destroy(Some((&frame, true)), &swap).unwrap();
        assert_eq!(file.contents(), [1; 4]);

        // Sticky dirtiness is enough on its own.
        let mut inherited = Page::new_file(0x3000, true, clean.file_source().unwrap().clone(), true);
        frame.bytes_mut()[..4].copy_from_slice(&[2; 4]);
        inherited.destroy(Some((&frame, false)), &swap).unwrap();
        assert_eq!(file.contents(), [2; 4]);
    }
}
