//! Supplemental page table
//!
//! Tracks, per page, everything the frame table and page-fault handler
//! need beyond what the hardware page directory itself stores: where a
//! non-resident page's data lives (a backing file offset or a swap slot)
//! and whether it may be demand-loaded again after eviction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::fs::File;
use crate::hw::{is_page_aligned, PAGE_SIZE};
use crate::swap::SwapSlot;

/// The three kinds of non-resident page this subsystem distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpteKind {
    /// Anonymous, swap-backed memory: stack pages and any page that was
    /// FILE or got promoted to CODE on eviction.
    Code,
    /// A read-only (or copy-on-write-never-taken) region of an executable,
    /// reloadable from its file and never written back -- unless it gets
    /// written, at which point it is promoted to `Code` before eviction.
    File,
    /// A `mmap`ed file region: written back to the file on eviction and on
    /// `munmap`/process exit if dirty.
    Mmap,
}

/// One supplemental page table entry: everything the VM core knows about
/// a single page beyond its hardware mapping.
pub struct SpteEntry {
    pub kind: SpteKind,
    pub upage: usize,
    pub writable: bool,
    pub pinned: bool,
    /// Set while the page is resident in a frame.
    pub frame: Option<usize>,
    /// Set while a CODE page's data lives in swap rather than a frame.
    pub swap_slot: Option<SwapSlot>,
    /// Backing file for FILE/MMAP entries; `None` for CODE.
    pub file: Option<Arc<File>>,
    pub file_offset: usize,
    /// Bytes of this page that come from the file; the remainder is
    /// zero-filled.
    pub read_bytes: usize,
}

impl SpteEntry {
    fn new_code(upage: usize) -> Self {
        Self {
            kind: SpteKind::Code,
            upage,
            writable: true,
            pinned: false,
            frame: None,
            swap_slot: None,
            file: None,
            file_offset: 0,
            read_bytes: 0,
        }
    }

    pub fn zero_bytes(&self) -> usize {
        PAGE_SIZE - self.read_bytes
    }

    /// FILE pages that were never written don't need a write-back; MMAP
    /// pages always do when dirty, and a FILE page that was opened
    /// writable follows the same rule once it turns out to be dirty.
    pub fn may_need_write_back(&self) -> bool {
        matches!(self.kind, SpteKind::Mmap) || (self.kind == SpteKind::File && self.writable)
    }
}

/// Write one entry's data back to its file if it is dirty and of a kind
/// that owns write-back. Free function (rather than a method) so callers
/// that already hold a `&SpteEntry` -- e.g. while tearing down a whole
/// table -- don't need a second lookup by upage.
pub fn write_back_entry(entry: &SpteEntry, dirty: bool, frame_bytes: &[u8; PAGE_SIZE]) -> bool {
    if !dirty || !entry.may_need_write_back() {
        return true;
    }
    let Some(file) = &entry.file else { return true };
    let written = file.write_at(entry.file_offset, &frame_bytes[..entry.read_bytes]);
    written == entry.read_bytes
}

/// A process's supplemental page table, keyed by page-aligned user
/// address.
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: HashMap<usize, SpteEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uvaddr: usize) -> Option<&SpteEntry> {
        self.entries.get(&crate::hw::page_round_down(uvaddr))
    }

    pub fn get_mut(&mut self, uvaddr: usize) -> Option<&mut SpteEntry> {
        self.entries.get_mut(&crate::hw::page_round_down(uvaddr))
    }

    pub fn contains(&self, upage: usize) -> bool {
        self.entries.contains_key(&upage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &SpteEntry)> {
        self.entries.iter()
    }

    /// `create_spte_code`: register one anonymous page (used for stack
    /// growth and any other demand-zero allocation).
    pub fn create_code(&mut self, upage: usize) {
        self.entries.insert(upage, SpteEntry::new_code(upage));
    }

    /// `create_spte_file`: register a run of read-only/executable pages
    /// backed by `file` starting at `ofs`, matching the original's
    /// `(read_bytes + zero_bytes) % PGSIZE == 0` contract via the caller
    /// supplying whole pages.
    pub fn create_file(
        &mut self,
        file: Arc<File>,
        mut ofs: usize,
        mut upage: usize,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) {
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;

            self.entries.insert(
                upage,
                SpteEntry {
                    kind: SpteKind::File,
                    upage,
                    writable,
                    pinned: false,
                    frame: None,
                    swap_slot: None,
                    file: Some(file.clone()),
                    file_offset: ofs,
                    read_bytes: page_read_bytes,
                },
            );

            ofs += page_read_bytes;
            read_bytes -= page_read_bytes;
            zero_bytes = zero_bytes.saturating_sub(page_zero_bytes);
            upage += PAGE_SIZE;
        }
    }

    /// `create_spte_mmap`: register a run of pages for a memory-mapped
    /// file, rejecting the whole mapping if any page it would need
    /// overlaps an existing entry. Returns the upages created, in order.
    pub fn create_mmap(
        &mut self,
        file: Arc<File>,
        upage: usize,
    ) -> VmResult<Vec<usize>> {
        if !is_page_aligned(upage) || upage == 0 {
            return Err(VmError::MmapMisaligned { addr: upage });
        }
        let len = file.length();
        if len == 0 {
            return Err(VmError::MmapBadLength);
        }

        let mut page = upage;
        let mut remaining = len;
        let mut ofs = 0usize;
        let mut created = Vec::new();

        while remaining > 0 {
            if self.entries.contains_key(&page) {
                return Err(VmError::MmapOverlap { upage: page });
            }
            page += PAGE_SIZE;
            remaining = remaining.saturating_sub(PAGE_SIZE);
        }

        let mut remaining = len;
        page = upage;
        while remaining > 0 {
            let page_read_bytes = remaining.min(PAGE_SIZE);
            self.entries.insert(
                page,
                SpteEntry {
                    kind: SpteKind::Mmap,
                    upage: page,
                    writable: true,
                    pinned: false,
                    frame: None,
                    swap_slot: None,
                    file: Some(file.clone()),
                    file_offset: ofs,
                    read_bytes: page_read_bytes,
                },
            );
            created.push(page);
            ofs += page_read_bytes;
            remaining -= page_read_bytes;
            page += PAGE_SIZE;
        }

        Ok(created)
    }

    /// Write an entry's data back to its file if it is dirty and of a
    /// kind that owns write-back (`write_to_disk`). `dirty` is the
    /// hardware dirty bit sampled by the caller; swap allocator frames
    /// already moved to swap never reach this path.
    pub fn write_back(&self, upage: usize, dirty: bool, frame_bytes: &[u8; PAGE_SIZE]) -> bool {
        let Some(entry) = self.entries.get(&upage) else {
            return true;
        };
        write_back_entry(entry, dirty, frame_bytes)
    }

    /// Drop every entry belonging to the mmap mapping that starts at
    /// `first_upage`, writing back any that are dirty. `unmap` supplies
    /// the hardware dirty bit and frame bytes for each page as it is torn
    /// down.
    pub fn free_mmap(
        &mut self,
        first_upage: usize,
        mut unmap: impl FnMut(usize, &SpteEntry) -> (bool, [u8; PAGE_SIZE]),
    ) {
        let Some(first) = self.entries.get(&first_upage) else {
            return;
        };
        let Some(file) = first.file.clone() else { return };
        let len = file.length();
        let mut upage = first_upage;
        let mut remaining = len;
        while remaining > 0 {
            let Some(entry) = self.entries.get(&upage) else {
                break;
            };
            if !Arc::ptr_eq(entry.file.as_ref().unwrap(), &file) {
                break;
            }
            let read_bytes = entry.read_bytes;
            let (dirty, bytes) = unmap(upage, entry);
            self.write_back(upage, dirty, &bytes);
            self.entries.remove(&upage);
            remaining = remaining.saturating_sub(read_bytes);
            upage += PAGE_SIZE;
        }
    }

    /// Remove every entry, calling `teardown` for each one so the caller
    /// can write back dirty pages, release frames, and free swap slots --
    /// including pages that are currently swapped out rather than
    /// resident, which still hold a slot that must come back.
    pub fn destroy(&mut self, mut teardown: impl FnMut(usize, &SpteEntry)) {
        for (upage, entry) in self.entries.iter() {
            teardown(*upage, entry);
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MemFile;

    #[test]
    fn create_file_splits_into_pages() {
        let mut spt = SupplementalPageTable::new();
        let file = Arc::new(File::new(Arc::new(MemFile::from_bytes(&vec![1u8; 5000]))));
        spt.create_file(file, 0, 0x1000, 5000, 8192 - 5000, false);
        assert_eq!(spt.len(), 2);
        assert_eq!(spt.get(0x1000).unwrap().read_bytes, PAGE_SIZE);
        assert_eq!(spt.get(0x2000).unwrap().read_bytes, 5000 - PAGE_SIZE);
    }

    #[test]
    fn mmap_rejects_overlap() {
        let mut spt = SupplementalPageTable::new();
        spt.create_code(0x3000);
        let file = Arc::new(File::new(Arc::new(MemFile::from_bytes(b"abc"))));
        let err = spt.create_mmap(file, 0x3000).unwrap_err();
        assert!(matches!(err, VmError::MmapOverlap { upage: 0x3000 }));
    }

    #[test]
    fn mmap_rejects_misaligned_and_empty() {
        let mut spt = SupplementalPageTable::new();
        let file = Arc::new(File::new(Arc::new(MemFile::from_bytes(b"abc"))));
        assert!(matches!(
            spt.create_mmap(file.clone(), 0x1001),
            Err(VmError::MmapMisaligned { .. })
        ));
        let empty = Arc::new(File::new(Arc::new(MemFile::from_bytes(b""))));
        assert!(matches!(
            spt.create_mmap(empty, 0x1000),
            Err(VmError::MmapBadLength)
        ));
    }
}
