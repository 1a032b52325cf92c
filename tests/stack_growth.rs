//! A write near the stack top grows the stack and is readable back
//! afterward.

use uvm_core::hw::PAGE_SIZE;
use uvm_core::testkit::{MemPageDirectory, MemSwapBackend};
use uvm_core::validate::UserSlice;
use uvm_core::VmSubsystem;

#[test]
fn write_below_esp_grows_stack_and_round_trips() {
    let mut vm = VmSubsystem::new(
        MemPageDirectory::new(),
        4,
        Box::new(MemSwapBackend::new(16)),
    );
    let esp = vm.layout.kernel_base - PAGE_SIZE;
    let buf_addr = esp - 4;

    {
        let mut slice = UserSlice::validate_write(&mut vm, esp, buf_addr, 1).unwrap();
        slice.write_from(&[1u8]);
    }

    let page = uvm_core::hw::page_round_down(buf_addr);
    assert!(vm.spt.contains(page));
    assert_eq!(vm.spt.get(page).unwrap().kind, uvm_core::spt::SpteKind::Code);

    let slice = UserSlice::validate_read(&mut vm, esp, buf_addr, 1).unwrap();
    assert_eq!(slice.read_to_vec(), vec![1u8]);
}
