//! User pointer validation and the `UserSlice` pin guard
//!
//! The original intertwines validating a user pointer with pinning the
//! page it lands on, and leaves unpinning to a separate, manually paired
//! call at the end of every syscall handler. `UserSlice` replaces that
//! pairing with RAII: constructing one validates and pins every page the
//! `[addr, addr+len)` range touches (demand-loading or growing the stack
//! as needed), and dropping it unpins them -- on every exit path,
//! including early returns from syscall argument errors.

use crate::error::{VmError, VmResult};
use crate::frame::FrameNumber;
use crate::hw::{page_round_down, PageDirectory, PAGE_SIZE};
use crate::spt::SpteKind;
use crate::vm::VmSubsystem;

/// Every page-aligned address the half-open range `[addr, addr+len)`
/// overlaps, each appearing exactly once. The original's `unpin_buffer`
/// walks `PGSIZE..size` by `PGSIZE` to find the interior pages, which
/// skips one when `size` isn't a multiple of the page size plus the
/// first page's remainder (see spec's open question on this); computing
/// the page range directly from the address span has no such gap.
pub fn touched_pages(addr: usize, len: usize) -> Vec<usize> {
    if len == 0 {
        return vec![page_round_down(addr)];
    }
    let start = page_round_down(addr);
    let end = page_round_down(addr + len - 1);
    (start..=end).step_by(PAGE_SIZE).collect()
}

/// Demand-load or grow the stack into `page` if it isn't resident yet.
/// Does not touch the pin flag -- callers decide whether to pin.
fn fault_in_page<D: PageDirectory>(
    vm: &mut VmSubsystem<D>,
    esp: usize,
    page: usize,
) -> VmResult<()> {
    if vm.spt.contains(page) {
        if vm.pagedir.get_page(page).is_none() {
            vm.install_load(page)?;
        }
        Ok(())
    } else if vm.pagedir.get_page(page).is_none() {
        if crate::stack::within_heuristic_margin(&vm.layout, esp, page) {
            vm.grow_stack(page, false)
        } else {
            Err(VmError::InvalidPointer { addr: page })
        }
    } else {
        Ok(())
    }
}

fn set_pinned<D: PageDirectory>(vm: &mut VmSubsystem<D>, page: usize, pinned: bool) {
    let _pin = vm.pin_lock.lock();
    if let Some(entry) = vm.spt.get_mut(page) {
        entry.pinned = pinned;
    }
}

/// A validated, pinned view of a user buffer. Pages stay resident for as
/// long as this value lives; dropping it unpins them.
pub struct UserSlice<'a, D: PageDirectory> {
    vm: &'a mut VmSubsystem<D>,
    addr: usize,
    len: usize,
    touched: Vec<usize>,
}

impl<'a, D: PageDirectory> UserSlice<'a, D> {
    /// Validate and pin a buffer the syscall will only read.
    pub fn validate_read(
        vm: &'a mut VmSubsystem<D>,
        esp: usize,
        addr: usize,
        len: usize,
    ) -> VmResult<Self> {
        Self::validate(vm, esp, addr, len, false)
    }

    /// Validate and pin a buffer the syscall will write into, rejecting
    /// it up front if it falls on a read-only FILE or MMAP page.
    pub fn validate_write(
        vm: &'a mut VmSubsystem<D>,
        esp: usize,
        addr: usize,
        len: usize,
    ) -> VmResult<Self> {
        Self::validate(vm, esp, addr, len, true)
    }

    fn validate(
        vm: &'a mut VmSubsystem<D>,
        esp: usize,
        addr: usize,
        len: usize,
        for_write: bool,
    ) -> VmResult<Self> {
        if addr == 0
            || !vm.layout.is_user_address(addr)
            || (len > 0 && !vm.layout.is_user_address(addr + len - 1))
        {
            log::warn!("rejected user pointer 0x{addr:x} (len {len})");
            return Err(VmError::InvalidPointer { addr });
        }

        let mut touched = Vec::new();
        for page in touched_pages(addr, len) {
            if let Err(e) = fault_in_page(vm, esp, page) {
                log::warn!("failed to fault in page 0x{page:x} for 0x{addr:x}: {e}");
                for p in &touched {
                    set_pinned(vm, *p, false);
                }
                return Err(e);
            }
            set_pinned(vm, page, true);
            touched.push(page);

            if for_write {
                if let Some(entry) = vm.spt.get(page) {
                    let read_only = matches!(entry.kind, SpteKind::File | SpteKind::Mmap)
                        && !entry.writable;
                    if read_only {
                        log::warn!("rejected write to read-only page 0x{page:x}");
                        for p in &touched {
                            set_pinned(vm, *p, false);
                        }
                        return Err(VmError::WriteToReadOnly { addr });
                    }
                }
            }
        }

        Ok(Self {
            vm,
            addr,
            len,
            touched,
        })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy this buffer's bytes out into a freshly allocated `Vec`.
    pub fn read_to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        let mut written = 0;
        let mut addr = self.addr;
        let mut remaining = self.len;
        while remaining > 0 {
            let page = page_round_down(addr);
            let offset = addr - page;
            let take = (PAGE_SIZE - offset).min(remaining);
            let frame_addr = self
                .vm
                .pagedir
                .get_page(page)
                .expect("validated page missing its mapping");
            let bytes = self.vm.frame_table.frame_bytes(FrameNumber(frame_addr));
            out[written..written + take].copy_from_slice(&bytes[offset..offset + take]);
            written += take;
            addr += take;
            remaining -= take;
        }
        out
    }

    /// Copy `data` into this buffer, marking every touched page dirty.
    pub fn write_from(&mut self, data: &[u8]) {
        assert_eq!(data.len(), self.len, "write_from length mismatch");
        let mut read = 0;
        let mut addr = self.addr;
        let mut remaining = self.len;
        while remaining > 0 {
            let page = page_round_down(addr);
            let offset = addr - page;
            let take = (PAGE_SIZE - offset).min(remaining);
            let frame_addr = self
                .vm
                .pagedir
                .get_page(page)
                .expect("validated page missing its mapping");
            let bytes = self.vm.frame_table.frame_bytes_mut(FrameNumber(frame_addr));
            bytes[offset..offset + take].copy_from_slice(&data[read..read + take]);
            self.vm.pagedir.set_dirty(page, true);
            read += take;
            addr += take;
            remaining -= take;
        }
    }
}

impl<'a, D: PageDirectory> Drop for UserSlice<'a, D> {
    fn drop(&mut self) {
        let _pin = self.vm.pin_lock.lock();
        for page in &self.touched {
            if let Some(entry) = self.vm.spt.get_mut(*page) {
                entry.pinned = false;
            }
        }
    }
}

/// `validate_string`: validate and read a NUL-terminated string one byte
/// at a time (its length isn't known up front), then hand back a
/// `UserSlice` covering exactly the bytes read (including the
/// terminator) so they stay pinned for the caller's use and get unpinned
/// on drop like any other buffer.
pub fn validate_cstr<'a, D: PageDirectory>(
    vm: &'a mut VmSubsystem<D>,
    esp: usize,
    addr: usize,
) -> VmResult<(UserSlice<'a, D>, Vec<u8>)> {
    if addr == 0 || !vm.layout.is_user_address(addr) {
        return Err(VmError::InvalidPointer { addr });
    }

    let mut bytes = Vec::new();
    let mut cursor = addr;
    loop {
        let page = page_round_down(cursor);
        fault_in_page(vm, esp, page)?;
        let frame_addr = vm
            .pagedir
            .get_page(page)
            .expect("fault_in_page guarantees residency");
        let offset = cursor - page;
        let byte = vm.frame_table.frame_bytes(FrameNumber(frame_addr))[offset];
        bytes.push(byte);
        cursor += 1;
        if byte == 0 {
            break;
        }
    }

    let slice = UserSlice::validate_read(vm, esp, addr, bytes.len())?;
    Ok((slice, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MemPageDirectory, MemSwapBackend};

    fn subsystem(frames: usize) -> VmSubsystem<MemPageDirectory> {
        VmSubsystem::new(
            MemPageDirectory::new(),
            frames,
            Box::new(MemSwapBackend::new(frames * 4)),
        )
    }

    #[test]
    fn touched_pages_covers_exact_span_no_gaps() {
        let pages = touched_pages(0x1ffe, 10);
        assert_eq!(pages, vec![0x1000, 0x2000]);

        let pages = touched_pages(0x1000, PAGE_SIZE * 3);
        assert_eq!(pages, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn rejects_kernel_space_pointer() {
        let mut vm = subsystem(4);
        let kernel_base = vm.layout.kernel_base;
        let err = UserSlice::validate_read(&mut vm, 0x2000, kernel_base, 1).unwrap_err();
        assert!(matches!(err, VmError::InvalidPointer { .. }));
    }

    #[test]
    fn grows_stack_within_heuristic_and_pins_it() {
        let mut vm = subsystem(4);
        let esp = vm.layout.kernel_base - PAGE_SIZE;
        {
            let slice = UserSlice::validate_write(&mut vm, esp, esp - 4, 4).unwrap();
            assert_eq!(slice.len(), 4);
            let page = page_round_down(esp - 4);
            assert!(vm.spt.get(page).unwrap().pinned);
        }
        let page = page_round_down(esp - 4);
        assert!(!vm.spt.get(page).unwrap().pinned);
    }

    #[test]
    fn rejects_write_to_read_only_file_page() {
        let mut vm = subsystem(4);
        let file = std::sync::Arc::new(crate::fs::File::new(std::sync::Arc::new(
            crate::testkit::MemFile::from_bytes(&vec![1u8; PAGE_SIZE]),
        )));
        vm.spt.create_file(file, 0, 0x1000, PAGE_SIZE, 0, false);
        let esp = vm.layout.kernel_base - PAGE_SIZE;
        let err = UserSlice::validate_write(&mut vm, esp, 0x1000, 1).unwrap_err();
        assert!(matches!(err, VmError::WriteToReadOnly { .. }));
    }
}
