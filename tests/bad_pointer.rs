//! Reading into a kernel-space address terminates the process with -1
//! and the exit status is observable through `wait`.

use uvm_core::process::{Process, ProcessEnv};
use uvm_core::syscall::{dispatch, SyscallOutcome};
use uvm_core::testkit::{MemFileSystem, MemPageDirectory, MemSwapBackend};
use uvm_core::VmSubsystem;

struct NoExec;
impl ProcessEnv for NoExec {
    fn exec(&mut self, _cmdline: &str) -> i32 {
        -1
    }
    fn wait(&mut self, _pid: i32) -> i32 {
        -1
    }
}

#[test]
fn read_into_kernel_space_terminates_process() {
    let mut vm = VmSubsystem::new(
        MemPageDirectory::new(),
        4,
        Box::new(MemSwapBackend::new(16)),
    );
    let mut process = Process::new(3, "prog");
    let mut env = NoExec;
    let fs = MemFileSystem::new();
    let esp = vm.layout.kernel_base - 4096;

    let outcome = dispatch(
        8, // READ
        &[0, vm.layout.kernel_base as i64, 1],
        &mut vm,
        &mut process,
        &mut env,
        &fs,
        esp,
    );

    assert!(matches!(outcome, SyscallOutcome::Terminate(-1)));
    assert_eq!(process.exit_state.wait(), -1);
}
