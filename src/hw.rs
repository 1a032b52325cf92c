//! Hardware page-directory interface
//!
//! The page-directory primitive is an external collaborator: a single
//! flat hardware page directory that the kernel environment provides
//! (`install_page`, `get_page`, `clear_page`, dirty/accessed bits). This
//! module defines that interface as a trait so the VM core can be built
//! and tested without real page-table hardware.

use bitflags::bitflags;

/// Size of one page/frame, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Round `addr` down to the start of its containing page.
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Offset of `addr` within its page.
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// `true` if `addr` is page-aligned.
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

bitflags! {
    /// Permission/state bits for a single page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
    }
}

/// Flags to `palloc`-style physical frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFlags {
    /// Allocate from the user pool (as opposed to the kernel pool).
    pub user: bool,
    /// Zero-fill the returned frame.
    pub zero: bool,
}

impl AllocFlags {
    pub const USER: Self = Self {
        user: true,
        zero: false,
    };
    pub const USER_ZERO: Self = Self {
        user: true,
        zero: true,
    };
}

/// The user/kernel address-space split and stack-growth bounds for a
/// running process. Kept explicit (not baked into constants) so tests can
/// use a small, fast address space instead of a real architecture's.
#[derive(Debug, Clone, Copy)]
pub struct VmLayout {
    /// First address that belongs to the kernel (`PHYS_BASE` in the
    /// original). Addresses `>= kernel_base` are never valid user
    /// pointers.
    pub kernel_base: usize,
    /// Margin below the stack pointer within which a faulting address is
    /// still considered legitimate stack growth (covers `pusha`-style
    /// multi-word pushes that fault below `esp` before it is updated).
    pub stack_heuristic: usize,
    /// Maximum size the stack is allowed to grow to.
    pub max_stack_size: usize,
}

impl VmLayout {
    /// A layout matching the original Pintos-style 32-bit convention:
    /// 3 GiB/1 GiB user/kernel split, a 32-byte heuristic margin, and an
    /// 8 MiB stack ceiling.
    pub const DEFAULT: Self = Self {
        kernel_base: 0xC000_0000,
        stack_heuristic: 32,
        max_stack_size: 8 * 1024 * 1024,
    };

    /// Whether `addr` is a non-null address in user space.
    pub fn is_user_address(&self, addr: usize) -> bool {
        addr != 0 && addr < self.kernel_base
    }
}

impl Default for VmLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The hardware page directory for one process's address space.
///
/// Implementations back this with real page tables; the crate's testkit
/// backs it with a `HashMap` simulating the same externally-observable
/// behavior (install/lookup/clear, and sampled accessed/dirty bits).
pub trait PageDirectory {
    /// Map `upage` to `frame_addr` with the given permissions. Returns
    /// `false` if the underlying page-table allocation failed.
    fn install_page(&mut self, upage: usize, frame_addr: usize, writable: bool) -> bool;

    /// Look up the frame address `upage` currently maps to, if any.
    fn get_page(&self, upage: usize) -> Option<usize>;

    /// Remove the mapping for `upage`, if any.
    fn clear_page(&mut self, upage: usize);

    /// Hardware dirty bit for `upage`'s mapping.
    fn is_dirty(&self, upage: usize) -> bool;

    /// Hardware accessed bit for `upage`'s mapping.
    fn is_accessed(&self, upage: usize) -> bool;

    /// Set the dirty bit for `upage`'s mapping.
    fn set_dirty(&mut self, upage: usize, value: bool);

    /// Set the accessed bit for `upage`'s mapping.
    fn set_accessed(&mut self, upage: usize, value: bool);
}
