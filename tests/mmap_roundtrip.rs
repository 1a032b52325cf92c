//! Mmap a file, mutate a page, munmap, and see the mutation land in the
//! file while untouched bytes survive.

use uvm_core::fs::{BackingFile, FileSystem};
use uvm_core::hw::PAGE_SIZE;
use uvm_core::testkit::{MemFileSystem, MemPageDirectory, MemSwapBackend};
use uvm_core::validate::UserSlice;
use uvm_core::VmSubsystem;

#[test]
fn mutate_then_munmap_writes_back_exact_byte() {
    let mut vm = VmSubsystem::new(
        MemPageDirectory::new(),
        4,
        Box::new(MemSwapBackend::new(16)),
    );
    let fs = MemFileSystem::new();
    assert!(fs.create("data.bin", 8192));
    {
        let backing = fs.open("data.bin").unwrap();
        backing.write_at(0, &vec![0xABu8; 8192]);
    }

    let backing = fs.open("data.bin").unwrap();
    let file = std::sync::Arc::new(uvm_core::fs::File::new(backing));

    let mmap_addr = 0x1000_0000usize;
    let created = vm.spt.create_mmap(file.clone(), mmap_addr).unwrap();
    assert_eq!(created.len(), 2); // 8192 bytes == 2 pages

    let esp = vm.layout.kernel_base - PAGE_SIZE;
    {
        let mut slice = UserSlice::validate_write(&mut vm, esp, mmap_addr + 1000, 1).unwrap();
        slice.write_from(&[0xCDu8]);
    }

    vm.unmap(mmap_addr);
    assert!(vm.spt.get(mmap_addr).is_none());

    let mut readback = [0u8; 2];
    file.read_at(999, &mut readback);
    assert_eq!(readback, [0xAB, 0xCD]);
}
