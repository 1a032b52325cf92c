//! The VM subsystem handle
//!
//! The original keeps its frame table, swap device and three of its four
//! locks as boot-time globals reached through `thread_current()`. This
//! crate has no scheduler to hang a "current thread" off of, and tests
//! should build fresh state per case rather than share statics -- so
//! every process-independent piece of VM state (frame pool, swap device,
//! lock order) lives in one `VmSubsystem` value that callers construct
//! explicitly and thread through.
//!
//! A `VmSubsystem` is scoped to one address space: its supplemental page
//! table and hardware page directory belong to a single process. This
//! narrows the original's single, truly global frame table (shared by
//! every process on the machine) to one frame pool per address space.
//! The per-page algorithms (eviction, promotion, swap) don't depend on
//! frames being shared across processes, only on reaching the owning
//! process's page directory and supplemental page table, so nothing here
//! needs a cross-process registry to stay correct for a single-process
//! caller.

use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::frame::FrameTable;
use crate::hw::{PageDirectory, VmLayout, PAGE_SIZE};
use crate::spt::{SpteKind, SupplementalPageTable};
use crate::swap::{SwapAllocator, SwapBackend};

macro_rules! named_lock {
    ($name:ident) => {
        /// A named, empty-payload lock whose only purpose is documenting
        /// and enforcing (at the call site, not the type level) this
        /// subsystem's lock acquisition order.
        #[derive(Default)]
        pub struct $name(Mutex<()>);

        impl $name {
            pub fn lock(&self) -> spin::MutexGuard<'_, ()> {
                self.0.lock()
            }
        }
    };
}

named_lock!(EvictLock);
named_lock!(PinLock);
named_lock!(FrameTableLock);
named_lock!(FileLock);

/// One address space's worth of demand-paging state: its supplemental
/// page table, the frame pool and swap device it draws from, and the
/// four locks that guard them.
///
/// Lock order, always: `evict_lock` -> `pin_lock` -> `frame_table_lock`
/// -> `file_lock`. Every method on this type that needs more than one
/// lock acquires them in that order.
pub struct VmSubsystem<D: PageDirectory> {
    pub spt: SupplementalPageTable,
    pub frame_table: FrameTable,
    pub swap: SwapAllocator,
    pub swap_backend: Box<dyn SwapBackend>,
    pub pagedir: D,
    pub layout: VmLayout,
    pub evict_lock: EvictLock,
    pub pin_lock: PinLock,
    pub frame_table_lock: FrameTableLock,
    pub file_lock: FileLock,
}

impl<D: PageDirectory> VmSubsystem<D> {
    pub fn new(
        pagedir: D,
        frame_capacity: usize,
        swap_backend: Box<dyn SwapBackend>,
    ) -> Self {
        let swap_capacity = swap_backend.slot_count();
        Self {
            spt: SupplementalPageTable::new(),
            frame_table: FrameTable::new(frame_capacity),
            swap: SwapAllocator::new(swap_capacity),
            swap_backend,
            pagedir,
            layout: VmLayout::default(),
            evict_lock: EvictLock::default(),
            pin_lock: PinLock::default(),
            frame_table_lock: FrameTableLock::default(),
            file_lock: FileLock::default(),
        }
    }

    /// `install_load_page`: demand-load `upage` into a frame, dispatching
    /// on its supplemental page table kind.
    pub fn install_load(&mut self, upage: usize) -> VmResult<()> {
        let _evict = self.evict_lock.lock();
        let kind = self
            .spt
            .get(upage)
            .ok_or(VmError::NoSuchMapping { upage })?
            .kind;

        match kind {
            SpteKind::Code => {
                let frame = self.frame_table.get_frame_for_page(
                    upage,
                    true,
                    &mut self.spt,
                    &mut self.pagedir,
                    &self.swap,
                    self.swap_backend.as_ref(),
                );

                if !self.pagedir.install_page(upage, frame.0, true) {
                    self.frame_table.free_frame(upage, &mut self.pagedir);
                    return Err(VmError::LoadFailed { upage });
                }

                let slot = self.spt.get(upage).unwrap().swap_slot;
                if let Some(slot) = slot {
                    let bytes = self.frame_table.frame_bytes_mut(frame);
                    self.swap.swap_in(self.swap_backend.as_ref(), slot, bytes);
                }
                let entry = self.spt.get_mut(upage).unwrap();
                entry.frame = Some(frame.0);
                entry.swap_slot = None;
                Ok(())
            }
            SpteKind::File | SpteKind::Mmap => {
                let frame = self.frame_table.get_frame_for_page(
                    upage,
                    false,
                    &mut self.spt,
                    &mut self.pagedir,
                    &self.swap,
                    self.swap_backend.as_ref(),
                );

                let entry_snapshot = {
                    let e = self.spt.get(upage).unwrap();
                    (e.file.clone().unwrap(), e.file_offset, e.read_bytes, e.writable)
                };
                let (file, ofs, read_bytes, writable) = entry_snapshot;

                let read = {
                    let _file_guard = self.file_lock.lock();
                    let bytes = self.frame_table.frame_bytes_mut(frame);
                    file.read_at(ofs, &mut bytes[..read_bytes])
                };
                if read != read_bytes {
                    self.frame_table.free_frame(upage, &mut self.pagedir);
                    return Err(VmError::LoadFailed { upage });
                }
                {
                    let bytes = self.frame_table.frame_bytes_mut(frame);
                    bytes[read_bytes..].fill(0);
                }

                if !self.pagedir.install_page(upage, frame.0, writable) {
                    self.frame_table.free_frame(upage, &mut self.pagedir);
                    return Err(VmError::LoadFailed { upage });
                }
                self.spt.get_mut(upage).unwrap().frame = Some(frame.0);
                Ok(())
            }
        }
    }

    /// `grow_stack`: register a new anonymous page below the current
    /// stack if doing so would not exceed the stack size ceiling, then
    /// demand-load it. `pinned` matches the original's call from
    /// `valid_up`, which pins the page it grows so it cannot be evicted
    /// out from under the syscall that is about to touch it.
    pub fn grow_stack(&mut self, fault_addr: usize, pinned: bool) -> VmResult<()> {
        let upage = crate::hw::page_round_down(fault_addr);
        if crate::stack::exceeds_stack_ceiling(&self.layout, fault_addr) {
            log::warn!("stack growth to 0x{fault_addr:x} exceeds the size ceiling");
            return Err(VmError::InvalidPointer { addr: fault_addr });
        }
        log::debug!("growing stack to include page 0x{upage:x}");
        self.spt.create_code(upage);
        if pinned {
            let _pin = self.pin_lock.lock();
            self.spt.get_mut(upage).unwrap().pinned = pinned;
        }
        self.install_load(upage)
    }

    /// `munmap`: tear down every page of the mapping that starts at
    /// `first_upage`, writing back dirty pages.
    pub fn unmap(&mut self, first_upage: usize) {
        let pagedir = &mut self.pagedir;
        let frame_table = &mut self.frame_table;
        self.spt.free_mmap(first_upage, |upage, entry| {
            let dirty = pagedir.is_dirty(upage);
            let bytes = entry
                .frame
                .map(|f| *frame_table.frame_bytes(crate::frame::FrameNumber(f)))
                .unwrap_or([0u8; PAGE_SIZE]);
            if entry.frame.is_some() {
                frame_table.free_frame(upage, pagedir);
            }
            (dirty, bytes)
        });
    }

    /// Drop every page the process owns, writing back dirty MMAP/writable
    /// FILE pages and freeing their frames and swap slots.
    pub fn destroy(&mut self) {
        let pagedir = &mut self.pagedir;
        let frame_table = &mut self.frame_table;
        let swap = &self.swap;
        self.spt.destroy(|upage, entry| {
            if let Some(frame) = entry.frame {
                let dirty = pagedir.is_dirty(upage);
                if entry.may_need_write_back() {
                    let bytes = *frame_table.frame_bytes(crate::frame::FrameNumber(frame));
                    let _ = crate::spt::write_back_entry(entry, dirty, &bytes);
                }
                frame_table.free_frame(upage, pagedir);
            }
            if let Some(slot) = entry.swap_slot {
                swap.free(slot);
            }
        });
    }
}
