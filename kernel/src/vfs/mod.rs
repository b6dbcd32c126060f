pub mod tempfs;

use alloc::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// offset does not fit the file system's address range
    BadOffset,
    /// no space left on device
    NoSpace,
    /// the underlying device failed
    Io,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadOffset => write!(f, "bad file offset"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::Io => write!(f, "input/output error"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// An open regular file.
///
/// Transfers are positional, so one handle can be shared by every page of a
/// mapping. Implementations serialize access to their own data.
pub trait File: Send + Sync {
    /// Read from the file into buf at offset.
    ///
    /// Returns the number of bytes read, which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Write to the file from buf at offset, growing the file if needed.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;
    /// Size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A shared handle to an open file. The file is closed when the last handle
/// is dropped.
pub type FileRef = Arc<dyn File>;

/// Opens another handle to the same file, which stays usable after the
/// caller closes `file`.
pub fn reopen(file: &FileRef) -> FileRef {
    Arc::clone(file)
}
