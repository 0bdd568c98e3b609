use crate::block::block_error::BlockError;
use crate::swapping::swap_space::SwapError;
use core::error::Error;
use core::fmt::{Debug, Display, Formatter};
use log::error;

/// Error type for the virtual memory subsystem
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Kernel address, or a user address no page and no stack growth covers
    BadAddress,
    /// The page already has a supplemental entry or a hardware mapping
    AlreadyMapped,
    /// No supplemental entry exists for the page
    NotMapped,
    /// Write to a page that is not writable
    ReadOnly,
    /// mmap address is not page-aligned
    Misaligned,
    /// mmap at address 0
    NullMapping,
    /// mmap of a zero-length file
    EmptyFile,
    /// mmap range overlaps existing pages, the stack reservation or kernel space
    MapConflict,
    /// No mapping has this id
    InvalidMapping,
    /// The file ended before a page's bytes could be read
    ShortRead,
    /// The file accepted fewer bytes than a page write-back needed
    ShortWrite,
    /// Every swap slot is in use
    OutOfSwap,
    /// The eviction scan found nothing to evict
    NoVictim,
    /// A swap slot was used that was never handed out
    BadSwapSlot,
    Block(BlockError),
}

impl VmError {
    /// Fatal errors mean a kernel invariant is broken, not that a process
    /// misbehaved. The caller halts the system instead of killing a process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VmError::OutOfSwap | VmError::NoVictim | VmError::BadSwapSlot
        )
    }

    /// Halts the system on a fatal error.
    pub fn halt(self) -> ! {
        error!("virtual memory: {self}, halting");
        panic!("{self}");
    }
}

impl Debug for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::BadAddress => write!(f, "BadAddress"),
            VmError::AlreadyMapped => write!(f, "AlreadyMapped"),
            VmError::NotMapped => write!(f, "NotMapped"),
            VmError::ReadOnly => write!(f, "ReadOnly"),
            VmError::Misaligned => write!(f, "Misaligned"),
            VmError::NullMapping => write!(f, "NullMapping"),
            VmError::EmptyFile => write!(f, "EmptyFile"),
            VmError::MapConflict => write!(f, "MapConflict"),
            VmError::InvalidMapping => write!(f, "InvalidMapping"),
            VmError::ShortRead => write!(f, "ShortRead"),
            VmError::ShortWrite => write!(f, "ShortWrite"),
            VmError::OutOfSwap => write!(f, "OutOfSwap"),
            VmError::NoVictim => write!(f, "NoVictim"),
            VmError::BadSwapSlot => write!(f, "BadSwapSlot"),
            VmError::Block(e) => write!(f, "Block({e:?})"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::BadAddress => write!(f, "invalid user address"),
            VmError::AlreadyMapped => write!(f, "page is already mapped"),
            VmError::NotMapped => write!(f, "page is not mapped"),
            VmError::ReadOnly => write!(f, "write to a read-only page"),
            VmError::Misaligned => write!(f, "mapping address is not page-aligned"),
            VmError::NullMapping => write!(f, "cannot map at address 0"),
            VmError::EmptyFile => write!(f, "cannot map an empty file"),
            VmError::MapConflict => write!(f, "mapping overlaps an existing region"),
            VmError::InvalidMapping => write!(f, "no such mapping"),
            VmError::ShortRead => write!(f, "short read while loading a page"),
            VmError::ShortWrite => write!(f, "short write while writing back a page"),
            VmError::OutOfSwap => write!(f, "swap space exhausted"),
            VmError::NoVictim => write!(f, "no frame could be evicted"),
            VmError::BadSwapSlot => write!(f, "swap slot is not in use"),
            VmError::Block(e) => write!(f, "block device error: {e}"),
        }
    }
}

impl Error for VmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VmError::Block(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BlockError> for VmError {
    fn from(e: BlockError) -> Self {
        VmError::Block(e)
    }
}

impl From<SwapError> for VmError {
    fn from(e: SwapError) -> Self {
        match e {
            SwapError::Full => VmError::OutOfSwap,
            SwapError::Block(e) => VmError::Block(e),
            SwapError::SlotOutOfRange | SwapError::SlotNotInUse => VmError::BadSwapSlot,
        }
    }
}
