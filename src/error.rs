//! Error types for the user virtual memory core
//!
//! One flat enum covering every disposition in the subsystem's error
//! handling design: pointer validation failures, syscall argument errors,
//! and the two fatal conditions (swap exhaustion, frame pool exhaustion
//! with all frames pinned) that the design presumes cannot happen in a
//! correctly sized system.

use core::fmt;

/// Result type alias used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;

/// Errors produced by the VM core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A user pointer was null, in kernel space, or could not be faulted
    /// in (not covered by the stack-growth heuristic, or the underlying
    /// load failed).
    InvalidPointer { addr: usize },
    /// A buffer the syscall intends to write into falls on a read-only
    /// page.
    WriteToReadOnly { addr: usize },
    /// An `fd` argument was out of the valid descriptor range.
    BadFileDescriptor { fd: i32 },
    /// A syscall number outside the dispatch table.
    UnknownSyscall { number: usize },
    /// Demand-loading an SPT entry failed (short read from the backing
    /// file, or the hardware mapping could not be installed).
    LoadFailed { upage: usize },
    /// `create_mmap` found an existing SPT entry at one of the pages it
    /// would need to install.
    MmapOverlap { upage: usize },
    /// `mmap`'s requested address is null or not page-aligned.
    MmapMisaligned { addr: usize },
    /// `mmap`'s backing file has zero length.
    MmapBadLength,
    /// A frame or SPT entry was addressed that the process does not own.
    NoSuchMapping { upage: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPointer { addr } => write!(f, "invalid user pointer 0x{addr:x}"),
            Self::WriteToReadOnly { addr } => {
                write!(f, "write to read-only page at 0x{addr:x}")
            }
            Self::BadFileDescriptor { fd } => write!(f, "bad file descriptor {fd}"),
            Self::UnknownSyscall { number } => write!(f, "unknown syscall number {number}"),
            Self::LoadFailed { upage } => write!(f, "failed to load page 0x{upage:x}"),
            Self::MmapOverlap { upage } => {
                write!(f, "mmap overlaps an existing mapping at 0x{upage:x}")
            }
            Self::MmapMisaligned { addr } => write!(f, "mmap address 0x{addr:x} not page-aligned"),
            Self::MmapBadLength => write!(f, "mmap of a zero-length file"),
            Self::NoSuchMapping { upage } => write!(f, "no mapping for page 0x{upage:x}"),
        }
    }
}

impl std::error::Error for VmError {}
