//! Frame table and enhanced second-chance page replacement
//!
//! A fixed pool of physical frames, handed out FIFO, reclaimed by the
//! three-phase victim scan: write back easy-to-clean dirty pages and take
//! the first non-accessed page (phase 1), clear accessed bits and retry
//! (phase 2), then fall back to strict FIFO if every frame is still both
//! dirty and accessed (phase 3).

use crate::hw::{PageDirectory, PAGE_SIZE};
use crate::spt::{SpteKind, SupplementalPageTable};
use crate::swap::{SwapAllocator, SwapBackend};

/// Index into the frame pool. Not a physical address -- the testkit and
/// any real backend are free to choose their own addressing scheme as
/// long as it round-trips through `PageDirectory::install_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameNumber(pub usize);

struct Bitmap {
    bits: Vec<u64>,
    len: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            bits: vec![0u64; len.div_ceil(64)],
            len,
        }
    }

    fn get(&self, i: usize) -> bool {
        self.bits[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize, value: bool) {
        if value {
            self.bits[i / 64] |= 1 << (i % 64);
        } else {
            self.bits[i / 64] &= !(1 << (i % 64));
        }
    }

    fn scan_and_flip(&mut self) -> Option<usize> {
        for word_idx in 0..self.bits.len() {
            let word = self.bits[word_idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let idx = word_idx * 64 + bit;
            if idx >= self.len {
                return None;
            }
            self.bits[word_idx] |= 1 << bit;
            return Some(idx);
        }
        None
    }
}

/// One resident frame: which pool slot it is, and which page currently
/// occupies it. The list order is insertion order, giving FIFO
/// tie-breaking for free for phase 3 of victim selection.
struct FrameTableEntry {
    frame: FrameNumber,
    upage: usize,
}

/// A sampled `(accessed, dirty, pinned, kind)` view of one resident frame,
/// used by `select_victim` so the selection logic itself never touches
/// hardware state directly.
#[derive(Debug, Clone, Copy)]
struct FrameSnapshot {
    pinned: bool,
    dirty: bool,
    accessed: bool,
    kind: SpteKind,
}

/// Outcome of scanning the frame list once.
enum ScanResult {
    /// Found a victim at this position in the resident list.
    Victim(usize),
    /// No unpinned frame exists at all.
    AllPinned,
    /// Scanned everything without finding an easy victim.
    Exhausted,
}

/// Phase 1: write back easy dirty pages in place, return the first
/// not-accessed, not-dirty (or not-accessed CODE) frame.
fn scan_phase_one(snapshots: &[FrameSnapshot]) -> ScanResult {
    let mut saw_unpinned = false;
    for (i, s) in snapshots.iter().enumerate() {
        if s.pinned {
            continue;
        }
        saw_unpinned = true;
        match s.kind {
            SpteKind::Code => {
                if !s.dirty && !s.accessed {
                    return ScanResult::Victim(i);
                }
            }
            SpteKind::File | SpteKind::Mmap => {
                if !s.dirty && !s.accessed {
                    return ScanResult::Victim(i);
                }
            }
        }
    }
    if !saw_unpinned {
        ScanResult::AllPinned
    } else {
        ScanResult::Exhausted
    }
}

/// Phase 2: any frame that is (after phase 1's write-backs) not dirty-or-
/// CODE and not accessed is a victim; everything else has its accessed
/// bit cleared for the next pass. Returns the clears to apply and the
/// victim, if any, in one scan (pure over the snapshot -- the caller
/// applies the accessed-bit clears to hardware).
fn scan_phase_two(snapshots: &[FrameSnapshot]) -> (Option<usize>, Vec<usize>) {
    let mut clears = Vec::new();
    for (i, s) in snapshots.iter().enumerate() {
        if s.pinned {
            continue;
        }
        let treat_as_clean = !s.dirty || s.kind == SpteKind::Code;
        if treat_as_clean && !s.accessed {
            return (Some(i), clears);
        }
        clears.push(i);
    }
    (None, clears)
}

/// Phase 3: every unpinned frame is both dirty and accessed; take the
/// first one in FIFO order.
fn scan_phase_three(snapshots: &[FrameSnapshot]) -> Option<usize> {
    snapshots.iter().position(|s| !s.pinned)
}

/// The frame pool and resident-page list.
pub struct FrameTable {
    storage: Vec<[u8; PAGE_SIZE]>,
    free: Bitmap,
    resident: Vec<FrameTableEntry>,
}

impl FrameTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![[0u8; PAGE_SIZE]; capacity],
            free: Bitmap::new(capacity),
            resident: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn frame_bytes(&self, frame: FrameNumber) -> &[u8; PAGE_SIZE] {
        &self.storage[frame.0]
    }

    pub fn frame_bytes_mut(&mut self, frame: FrameNumber) -> &mut [u8; PAGE_SIZE] {
        &mut self.storage[frame.0]
    }

    fn take_free_frame(&mut self) -> Option<FrameNumber> {
        self.free.scan_and_flip().map(FrameNumber)
    }

    fn snapshot<D: PageDirectory>(&self, spt: &SupplementalPageTable, pd: &D) -> Vec<FrameSnapshot> {
        self.resident
            .iter()
            .map(|e| {
                let entry = spt.get(e.upage).expect("resident frame has no spte");
                FrameSnapshot {
                    pinned: entry.pinned,
                    dirty: pd.is_dirty(e.upage),
                    accessed: pd.is_accessed(e.upage),
                    kind: entry.kind,
                }
            })
            .collect()
    }

    /// Select and reclaim one victim frame, running the full three-phase
    /// scan. Returns the reclaimed frame number. Panics (matching the
    /// original's `PANIC`) if every frame is pinned -- a configuration
    /// error, since the caller must never pin more pages than there are
    /// frames.
    fn evict<D: PageDirectory>(
        &mut self,
        spt: &mut SupplementalPageTable,
        pd: &mut D,
        swap: &SwapAllocator,
        swap_backend: &dyn SwapBackend,
    ) -> FrameNumber {
        assert!(!self.resident.is_empty(), "evict called with no resident frames");
        log::debug!("evicting a frame: {} resident", self.resident.len());

        // Phase 1: write back easy dirty pages as we scan; the first
        // non-dirty non-accessed page (by its current state) wins.
        let victim_idx = loop {
            let snapshots = self.snapshot(spt, pd);
            let mut wrote_back = false;
            for (i, s) in snapshots.iter().enumerate() {
                if s.pinned || s.kind == SpteKind::Code {
                    continue;
                }
                if s.dirty {
                    let upage = self.resident[i].upage;
                    let frame = self.resident[i].frame;
                    if spt.write_back(upage, true, self.frame_bytes(frame)) {
                        pd.set_dirty(upage, false);
                        wrote_back = true;
                    }
                }
            }
            match scan_phase_one(&self.snapshot(spt, pd)) {
                ScanResult::Victim(i) => break i,
                ScanResult::AllPinned => {
                    log::error!("eviction requested with every frame pinned");
                    panic!("evict called with every frame pinned");
                }
                ScanResult::Exhausted => {
                    if !wrote_back {
                        break self.phase_two_and_three(spt, pd);
                    }
                    // A write-back happened; loop once more so the
                    // now-clean page can be picked up by phase 1 itself,
                    // matching the original's re-entrant dirty check.
                    continue;
                }
            }
        };

        let upage = self.resident[victim_idx].upage;
        log::trace!("victim selected: page 0x{upage:x}");
        self.reclaim(victim_idx, spt, pd, swap, swap_backend)
    }

    fn phase_two_and_three<D: PageDirectory>(
        &self,
        spt: &SupplementalPageTable,
        pd: &mut D,
    ) -> usize {
        let snapshots = self.snapshot(spt, pd);
        let (victim, clears) = scan_phase_two(&snapshots);
        for i in clears {
            pd.set_accessed(self.resident[i].upage, false);
        }
        if let Some(i) = victim {
            return i;
        }
        let snapshots = self.snapshot(spt, pd);
        scan_phase_three(&snapshots).expect("evict called with every frame pinned")
    }

    /// Evict the resident entry at `idx`, dispatching write-back/promotion
    /// by its SPT kind, and return the now-free frame.
    fn reclaim<D: PageDirectory>(
        &mut self,
        idx: usize,
        spt: &mut SupplementalPageTable,
        pd: &mut D,
        swap: &SwapAllocator,
        swap_backend: &dyn SwapBackend,
    ) -> FrameNumber {
        let FrameTableEntry { frame, upage } = self.resident.remove(idx);
        let dirty = pd.is_dirty(upage);

        let kind = spt.get(upage).unwrap().kind;
        match kind {
            SpteKind::Mmap => {
                if !spt.write_back(upage, dirty, self.frame_bytes(frame)) {
                    panic!("not able to write out mmap page at eviction");
                }
                let entry = spt.get_mut(upage).unwrap();
                entry.frame = None;
            }
            SpteKind::File => {
                // A FILE page being evicted is promoted to CODE before
                // falling into the CODE path below: it is never written
                // back to the original file, only ever to swap from now
                // on.
                let entry = spt.get_mut(upage).unwrap();
                entry.kind = SpteKind::Code;
                self.swap_out_entry(upage, frame, spt, swap, swap_backend);
            }
            SpteKind::Code => {
                self.swap_out_entry(upage, frame, spt, swap, swap_backend);
            }
        }

        // The bit for `frame` stays set: `reclaim` only runs as part of
        // `get_frame_for_page`'s eviction path, which immediately rebinds
        // this same frame to the new page rather than returning it to the
        // free pool. Clearing the bit here would let the next
        // `take_free_frame` hand out a frame that is still resident.
        pd.clear_page(upage);
        frame
    }

    fn swap_out_entry(
        &self,
        upage: usize,
        frame: FrameNumber,
        spt: &mut SupplementalPageTable,
        swap: &SwapAllocator,
        swap_backend: &dyn SwapBackend,
    ) {
        let slot = swap.swap_out(swap_backend, self.frame_bytes(frame)).unwrap_or_else(|| {
            log::error!("swap device exhausted evicting page 0x{upage:x}");
            panic!("swap device exhausted");
        });
        let entry = spt.get_mut(upage).unwrap();
        entry.swap_slot = Some(slot);
        entry.frame = None;
    }

    /// Allocate a frame for `upage`, evicting if the pool is full.
    /// `zero` zero-fills the frame first (demand-zero CODE pages).
    pub fn get_frame_for_page<D: PageDirectory>(
        &mut self,
        upage: usize,
        zero: bool,
        spt: &mut SupplementalPageTable,
        pd: &mut D,
        swap: &SwapAllocator,
        swap_backend: &dyn SwapBackend,
    ) -> FrameNumber {
        let frame = match self.take_free_frame() {
            Some(f) => f,
            None => self.evict(spt, pd, swap, swap_backend),
        };
        if zero {
            self.storage[frame.0] = [0u8; PAGE_SIZE];
        }
        self.resident.push(FrameTableEntry { frame, upage });
        frame
    }

    /// Release `upage`'s frame back to the free pool without writing
    /// anything back or touching swap (the caller has already decided
    /// that's unnecessary, e.g. a CODE page on process exit).
    pub fn free_frame(&mut self, upage: usize, pd: &mut impl PageDirectory) {
        if let Some(pos) = self.resident.iter().position(|e| e.upage == upage) {
            let entry = self.resident.remove(pos);
            pd.clear_page(upage);
            self.free.set(entry.frame.0, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MemPageDirectory, MemSwapBackend};

    fn setup(capacity: usize) -> (FrameTable, SupplementalPageTable, MemPageDirectory, SwapAllocator, MemSwapBackend) {
        (
            FrameTable::new(capacity),
            SupplementalPageTable::new(),
            MemPageDirectory::new(),
            SwapAllocator::new(capacity * 4),
            MemSwapBackend::new(capacity * 4),
        )
    }

    #[test]
    fn allocates_from_free_pool_first() {
        let (mut ft, mut spt, mut pd, swap, backend) = setup(2);
        spt.create_code(0x1000);
        spt.create_code(0x2000);
        let f1 = ft.get_frame_for_page(0x1000, true, &mut spt, &mut pd, &swap, &backend);
        let f2 = ft.get_frame_for_page(0x2000, true, &mut spt, &mut pd, &swap, &backend);
        assert_ne!(f1, f2);
        assert_eq!(ft.resident_count(), 2);
    }

    #[test]
    fn evicts_not_accessed_frame_first() {
        let (mut ft, mut spt, mut pd, swap, backend) = setup(2);
        spt.create_code(0x1000);
        spt.create_code(0x2000);
        ft.get_frame_for_page(0x1000, true, &mut spt, &mut pd, &swap, &backend);
        ft.get_frame_for_page(0x2000, true, &mut spt, &mut pd, &swap, &backend);
        // Mark 0x1000 as accessed so 0x2000 (not accessed) is the victim.
        pd.set_accessed(0x1000, true);

        spt.create_code(0x3000);
        ft.get_frame_for_page(0x3000, true, &mut spt, &mut pd, &swap, &backend);

        assert!(spt.get(0x2000).unwrap().swap_slot.is_some());
        assert!(spt.get(0x1000).unwrap().frame.is_none() || spt.get(0x1000).unwrap().swap_slot.is_none());
        assert_eq!(ft.resident_count(), 2);
    }

    #[test]
    fn pinned_frames_are_never_evicted() {
        let (mut ft, mut spt, mut pd, swap, backend) = setup(1);
        spt.create_code(0x1000);
        ft.get_frame_for_page(0x1000, true, &mut spt, &mut pd, &swap, &backend);
        spt.get_mut(0x1000).unwrap().pinned = true;

        spt.create_code(0x2000);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ft.get_frame_for_page(0x2000, true, &mut spt, &mut pd, &swap, &backend)
        }));
        assert!(result.is_err());
    }
}
