use crate::block::BlockError;
use crate::vfs;
use core::error::Error;
use core::fmt::{Display, Formatter};

/// Why a virtual memory operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Null page, kernel address, or otherwise unusable address
    InvalidAddress,
    /// No page is registered at the address
    Unmapped,
    /// Access not allowed by the page's protection
    ProtectionViolation,
    /// A page is already registered at the address
    AlreadyMapped,
    /// Bad length, offset, or file for the request
    InvalidArgument,
    /// The swap device failed
    Block(BlockError),
    /// A backing file failed
    File(vfs::Error),
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::Unmapped => write!(f, "address not mapped"),
            Self::ProtectionViolation => write!(f, "protection violation"),
            Self::AlreadyMapped => write!(f, "address already mapped"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Block(err) => write!(f, "swap: {err}"),
            Self::File(err) => write!(f, "file: {err}"),
        }
    }
}

impl Error for VmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Block(err) => Some(err),
            Self::File(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Block(err)
    }
}

impl From<vfs::Error> for VmError {
    fn from(err: vfs::Error) -> Self {
        Self::File(err)
    }
}
