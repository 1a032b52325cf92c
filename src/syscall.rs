//! Syscall dispatch
//!
//! The original reads the call number and each argument directly off the
//! user stack pointer in the trap frame via a function-pointer table
//! indexed by syscall number. This crate has no trap frame -- the
//! frontend that owns the actual trap handler decodes the raw word
//! arguments and passes them in, and `dispatch` is a plain `match` in
//! their place.

use std::sync::Arc;

use crate::fs::{File, FileSystem};
use crate::hw::PageDirectory;
use crate::process::{self, Process, ProcessEnv};
use crate::validate::{validate_cstr, UserSlice};
use crate::vm::VmSubsystem;

/// A syscall number outside 0..=19, or one of the unimplemented
/// directory syscalls (15..=19), both handled the same way the original
/// handles them: by terminating the caller.
pub const SYSCALL_COUNT: usize = 20;

/// What the dispatcher did with one syscall.
pub enum SyscallOutcome {
    /// The syscall completed normally; this is the value placed in the
    /// return register.
    Return(i64),
    /// `HALT`: the machine powers off and never returns.
    Halt,
    /// The calling process was terminated with this status -- a bad
    /// pointer, a write to a read-only page, or an unknown/unsupported
    /// syscall number.
    Terminate(i32),
}

/// `HALT`: shuts the system down. The original writes directly to the
/// ACPI power-off port; there is no hosted equivalent, so this logs and
/// exits the process instead -- the one syscall that truly never returns
/// to its caller.
pub fn halt() -> ! {
    log::info!("system halted");
    std::process::exit(0);
}

fn terminate<D: PageDirectory>(
    vm: &mut VmSubsystem<D>,
    process: &mut Process,
    status: i32,
) -> SyscallOutcome {
    vm.destroy();
    process.exit_state.signal_exit(status);
    log::info!("{}", process::exit_message(process.progname(), status));
    SyscallOutcome::Terminate(status)
}

/// Dispatch one syscall. `args` holds exactly the arguments the syscall
/// takes (already decoded from the trap frame by the caller), in order.
pub fn dispatch<D: PageDirectory>(
    number: usize,
    args: &[i64],
    vm: &mut VmSubsystem<D>,
    process: &mut Process,
    env: &mut dyn ProcessEnv,
    fs: &dyn FileSystem,
    esp: usize,
) -> SyscallOutcome {
    let outcome = match number {
        0 => halt(),
        1 => {
            let status = args.first().copied().unwrap_or(-1) as i32;
            terminate(vm, process, status)
        }
        2 => {
            let out = {
                let result = validate_cstr(vm, esp, args[0] as usize);
                match result {
                    Ok((_slice, bytes)) => {
                        let cmdline = String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned();
                        Ok(cmdline)
                    }
                    Err(_) => Err(()),
                }
            };
            match out {
                Ok(cmdline) => SyscallOutcome::Return(env.exec(&cmdline) as i64),
                Err(()) => terminate(vm, process, -1),
            }
        }
        3 => SyscallOutcome::Return(env.wait(args[0] as i32) as i64),
        4 => {
            let out = {
                let result = validate_cstr(vm, esp, args[0] as usize);
                match result {
                    Ok((_slice, bytes)) => {
                        let name = String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned();
                        Ok(name)
                    }
                    Err(_) => Err(()),
                }
            };
            match out {
                Ok(name) => {
                    let size = args[1] as usize;
                    SyscallOutcome::Return(fs.create(&name, size) as i64)
                }
                Err(()) => terminate(vm, process, -1),
            }
        }
        5 => {
            let out = {
                let result = validate_cstr(vm, esp, args[0] as usize);
                match result {
                    Ok((_slice, bytes)) => {
                        let name = String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned();
                        Ok(name)
                    }
                    Err(_) => Err(()),
                }
            };
            match out {
                Ok(name) => SyscallOutcome::Return(fs.remove(&name) as i64),
                Err(()) => terminate(vm, process, -1),
            }
        }
        6 => {
            let out = {
                let result = validate_cstr(vm, esp, args[0] as usize);
                match result {
                    Ok((_slice, bytes)) => {
                        let name = String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned();
                        Ok(name)
                    }
                    Err(_) => Err(()),
                }
            };
            match out {
                Ok(name) => match fs.open(&name) {
                    Some(backing) => {
                        let file = Arc::new(File::new(backing));
                        match process.open_fd(file) {
                            Some(fd) => SyscallOutcome::Return(fd as i64),
                            None => SyscallOutcome::Return(-1),
                        }
                    }
                    None => SyscallOutcome::Return(-1),
                },
                Err(()) => terminate(vm, process, -1),
            }
        }
        7 => {
            let fd = args[0] as i32;
            match process.file(fd) {
                Some(file) => SyscallOutcome::Return(file.length() as i64),
                None => SyscallOutcome::Return(-1),
            }
        }
        8 => {
            let fd = args[0] as i32;
            let addr = args[1] as usize;
            let size = args[2] as usize;
            let Ok(mut slice) = UserSlice::validate_write(vm, esp, addr, size) else {
                return terminate(vm, process, -1);
            };
            let ret = if fd == 0 {
                // No keyboard backend in this crate; matches a console
                // with no pending input.
                vec![0u8; 0]
            } else if let Some(file) = process.file(fd) {
                let mut buf = vec![0u8; size];
                let n = file.read(&mut buf[..]);
                buf.truncate(n);
                buf
            } else {
                vec![0u8; 0]
            };
            let n = ret.len();
            let mut padded = ret;
            padded.resize(size, 0);
            slice.write_from(&padded);
            SyscallOutcome::Return(n as i64)
        }
        9 => {
            let fd = args[0] as i32;
            let addr = args[1] as usize;
            let size = args[2] as usize;
            let Ok(slice) = UserSlice::validate_read(vm, esp, addr, size) else {
                return terminate(vm, process, -1);
            };
            let data = slice.read_to_vec();
            let written = if fd == 1 {
                log::info!(target: "uvm_core::console", "{}", String::from_utf8_lossy(&data));
                data.len()
            } else if let Some(file) = process.file(fd) {
                file.write(&data)
            } else {
                0
            };
            SyscallOutcome::Return(written as i64)
        }
        10 => {
            let fd = args[0] as i32;
            let pos = args[1] as usize;
            if let Some(file) = process.file(fd) {
                file.seek(pos);
            }
            SyscallOutcome::Return(0)
        }
        11 => {
            let fd = args[0] as i32;
            match process.file(fd) {
                Some(file) => SyscallOutcome::Return(file.tell() as i64),
                None => SyscallOutcome::Return(-1),
            }
        }
        12 => {
            process.close_fd(args[0] as i32);
            SyscallOutcome::Return(0)
        }
        13 => {
            let fd = args[0] as i32;
            let addr = args[1] as usize;
            if !Process::is_valid_fd(fd) || !crate::hw::is_page_aligned(addr) || addr == 0 {
                return SyscallOutcome::Return(-1);
            }
            let Some(file) = process.file(fd) else {
                return SyscallOutcome::Return(-1);
            };
            let reopened = Arc::new(file.reopen());
            match vm.spt.create_mmap(reopened, addr) {
                Ok(first_page_and_rest) => {
                    let first_upage = first_page_and_rest[0];
                    SyscallOutcome::Return(process.new_map_id(first_upage) as i64)
                }
                Err(_) => SyscallOutcome::Return(-1),
            }
        }
        14 => {
            let map_id = args[0] as i32;
            if let Some(first_upage) = process.remove_mmap(map_id) {
                vm.unmap(first_upage);
            }
            SyscallOutcome::Return(0)
        }
        15..=19 => terminate(vm, process, -1),
        _ => terminate(vm, process, -1),
    };
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MemFileSystem, MemPageDirectory, MemSwapBackend};

    struct NoExec;
    impl ProcessEnv for NoExec {
        fn exec(&mut self, _cmdline: &str) -> i32 {
            -1
        }
        fn wait(&mut self, _pid: i32) -> i32 {
            -1
        }
    }

    fn subsystem(frames: usize) -> VmSubsystem<MemPageDirectory> {
        VmSubsystem::new(
            MemPageDirectory::new(),
            frames,
            Box::new(MemSwapBackend::new(frames * 4)),
        )
    }

    #[test]
    fn bad_pointer_terminates_with_minus_one() {
        let mut vm = subsystem(4);
        let mut process = Process::new(1, "prog");
        let mut env = NoExec;
        let fs = MemFileSystem::new();
        let kernel_base = vm.layout.kernel_base as i64;
        let esp = vm.layout.kernel_base - 4096;
        let outcome = dispatch(
            8,
            &[0, kernel_base, 1],
            &mut vm,
            &mut process,
            &mut env,
            &fs,
            esp,
        );
        assert!(matches!(outcome, SyscallOutcome::Terminate(-1)));
        assert_eq!(process.exit_state.wait(), -1);
    }

    #[test]
    fn create_open_write_read_round_trip() {
        let mut vm = subsystem(4);
        let mut process = Process::new(1, "prog");
        let mut env = NoExec;
        let fs = MemFileSystem::new();
        assert!(fs.create("a.txt", 16));

        let esp = vm.layout.kernel_base - 4096;
        let name_page = esp - 4096;
        vm.spt.create_code(crate::hw::page_round_down(name_page));
        {
            let mut slice = UserSlice::validate_write(&mut vm, esp, name_page, 6).unwrap();
            slice.write_from(b"a.txt\0");
        }

        let open = dispatch(6, &[name_page as i64], &mut vm, &mut process, &mut env, &fs, esp);
        let fd = match open {
            SyscallOutcome::Return(v) => v as i32,
            _ => panic!("open failed"),
        };
        assert!(fd >= 2);

        let buf_page = esp - 2 * 4096;
        vm.spt.create_code(crate::hw::page_round_down(buf_page));
        {
            let mut slice = UserSlice::validate_write(&mut vm, esp, buf_page, 5).unwrap();
            slice.write_from(b"hello");
        }
        let written = dispatch(
            9,
            &[fd as i64, buf_page as i64, 5],
            &mut vm,
            &mut process,
            &mut env,
            &fs,
            esp,
        );
        assert!(matches!(written, SyscallOutcome::Return(5)));

        dispatch(10, &[fd as i64, 0], &mut vm, &mut process, &mut env, &fs, esp);
        let read_outcome = dispatch(
            8,
            &[fd as i64, buf_page as i64, 5],
            &mut vm,
            &mut process,
            &mut env,
            &fs,
            esp,
        );
        assert!(matches!(read_outcome, SyscallOutcome::Return(5)));
    }

    #[test]
    fn directory_syscalls_terminate() {
        let mut vm = subsystem(4);
        let mut process = Process::new(1, "prog");
        let mut env = NoExec;
        let fs = MemFileSystem::new();
        let esp = vm.layout.kernel_base - 4096;
        let outcome = dispatch(16, &[0], &mut vm, &mut process, &mut env, &fs, esp);
        assert!(matches!(outcome, SyscallOutcome::Terminate(-1)));
    }
}
