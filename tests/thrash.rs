//! Allocate twice the frame pool's worth of anonymous pages, forcing
//! eviction and swap-in for every one of them, and see every sentinel
//! byte survive the round trip. Swap usage returns to zero once the
//! process tears down.

use uvm_core::hw::PAGE_SIZE;
use uvm_core::testkit::{MemPageDirectory, MemSwapBackend};
use uvm_core::validate::UserSlice;
use uvm_core::VmSubsystem;

#[test]
fn thrash_round_trips_every_sentinel_and_frees_swap_on_exit() {
    const FRAMES: usize = 3;
    const PAGES: usize = FRAMES * 2;

    let mut vm = VmSubsystem::new(
        MemPageDirectory::new(),
        FRAMES,
        Box::new(MemSwapBackend::new(PAGES * 2)),
    );
    let esp = vm.layout.kernel_base - PAGE_SIZE;

    // Register every page up front as anonymous (CODE) memory, the way a
    // heap allocator would; `UserSlice` then demand-loads each one
    // through the ordinary "already in the SPT" path instead of stack
    // growth, which only ever grows by one page at a time.
    let addrs: Vec<usize> = (0..PAGES).map(|i| 0x2000_0000 + i * PAGE_SIZE).collect();
    for &addr in &addrs {
        vm.spt.create_code(addr);
    }

    for (i, &addr) in addrs.iter().enumerate() {
        let mut slice = UserSlice::validate_write(&mut vm, esp, addr, 1).unwrap();
        slice.write_from(&[i as u8]);
    }
    assert!(vm.swap.used_slots() > 0, "pool is smaller than PAGES, eviction must have run");

    for (i, &addr) in addrs.iter().enumerate() {
        let slice = UserSlice::validate_read(&mut vm, esp, addr, 1).unwrap();
        assert_eq!(slice.read_to_vec(), vec![i as u8], "sentinel mismatch at page {i}");
    }

    vm.destroy();
    assert_eq!(vm.swap.used_slots(), 0);
}
