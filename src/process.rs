//! Per-process file/mmap tables and exit/wait handoff
//!
//! Narrowed from a full POSIX wait-status encoding and a zombie table
//! reaped by a scheduler this crate doesn't have, down to the exact
//! contract needed here: one exit status integer per child, a `-1`
//! sentinel for "no such status" (never waited for, or already reaped),
//! and a direct parent-to-child handle instead of a global process table.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::fs::File;

/// Fixed size of a process's file and mmap descriptor tables. Slots 0
/// and 1 are reserved for stdin/stdout and never handed out by `open`.
pub const MAX_FILES: usize = 128;

/// The load/ack/terminated rendezvous a thread needs to block on a
/// one-shot event. Implemented once here and reused for both the
/// exec-time load acknowledgment and any other single-shot handoff a
/// caller needs.
pub trait ThreadHandoff: Send + Sync {
    fn signal(&self);
    fn wait(&self);
}

/// A counting semaphore, the original's primitive for every blocking
/// rendezvous in this subsystem. Built on `std::sync::{Mutex, Condvar}`
/// as the hosted equivalent of a hand-rolled semaphore that would
/// otherwise spin against a scheduler this crate does not have.
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    pub fn up(&self) {
        *self.count.lock().unwrap() += 1;
        self.condvar.notify_one();
    }

    pub fn down(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
    }
}

impl ThreadHandoff for Semaphore {
    fn signal(&self) {
        self.up();
    }

    fn wait(&self) {
        self.down();
    }
}

#[derive(Clone, Copy)]
enum ExitRecord {
    Pending,
    Exited(i32),
    Reaped,
}

/// The exit status a child process hands its parent exactly once. A
/// second `wait` on an already-reaped child returns the `-1` sentinel
/// rather than blocking again.
pub struct ExitState {
    record: Mutex<ExitRecord>,
    condvar: Condvar,
}

impl Default for ExitState {
    fn default() -> Self {
        Self {
            record: Mutex::new(ExitRecord::Pending),
            condvar: Condvar::new(),
        }
    }
}

impl ExitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the process's exit status and wake any waiter.
    pub fn signal_exit(&self, status: i32) {
        *self.record.lock().unwrap() = ExitRecord::Exited(status);
        self.condvar.notify_all();
    }

    /// Block until the process exits, returning its status exactly once;
    /// every call after the first returns `-1` without blocking.
    pub fn wait(&self) -> i32 {
        let mut record = self.record.lock().unwrap();
        loop {
            match *record {
                ExitRecord::Pending => record = self.condvar.wait(record).unwrap(),
                ExitRecord::Exited(status) => {
                    *record = ExitRecord::Reaped;
                    return status;
                }
                ExitRecord::Reaped => return -1,
            }
        }
    }
}

/// The process-lifecycle half of the kernel environment `exec`/`wait`
/// need: spawning a child address space and running it is entirely
/// outside this crate's scope (no loader, no scheduler), so the syscall
/// dispatcher reaches it through this trait instead of owning it.
pub trait ProcessEnv {
    /// Start `cmdline` as a child process, blocking until it has either
    /// finished loading or failed to. Returns its pid, or `-1` on load
    /// failure.
    fn exec(&mut self, cmdline: &str) -> i32;

    /// Block until `pid` exits and return its status, or `-1` if `pid`
    /// is not a child or has already been waited for.
    fn wait(&mut self, pid: i32) -> i32;
}

/// A running process: its open-file table, its mmap table, and the
/// handles the rest of the crate needs to terminate or wait on it.
pub struct Process {
    pub pid: i32,
    pub name: String,
    files: Vec<Option<Arc<File>>>,
    next_map_id: i32,
    mmaps: HashMap<i32, usize>,
    pub exit_state: Arc<ExitState>,
    /// Signaled once the child has finished loading its executable, so
    /// `exec` can report failure instead of a bogus pid.
    pub load_ack: Semaphore,
}

impl Process {
    pub fn new(pid: i32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            files: vec![None; MAX_FILES],
            next_map_id: 2,
            mmaps: HashMap::new(),
            exit_state: Arc::new(ExitState::new()),
            load_ack: Semaphore::new(0),
        }
    }

    /// The first whitespace-delimited token of the process name, used in
    /// the exit convention string.
    pub fn progname(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }

    /// `is_valid_fd`: only the table's index range, not whether a file is
    /// actually open there.
    pub fn is_valid_fd(fd: i32) -> bool {
        fd >= 0 && (fd as usize) < MAX_FILES
    }

    /// Install `file` in the lowest free slot at or above 2, returning
    /// its descriptor, or `None` if the table is full.
    pub fn open_fd(&mut self, file: Arc<File>) -> Option<i32> {
        (2..MAX_FILES).find(|&i| self.files[i].is_none()).map(|i| {
            self.files[i] = Some(file);
            i as i32
        })
    }

    pub fn file(&self, fd: i32) -> Option<&Arc<File>> {
        if !Self::is_valid_fd(fd) {
            return None;
        }
        self.files[fd as usize].as_ref()
    }

    /// `close_file`: idempotent -- closing an already-closed or
    /// out-of-range descriptor is a no-op, never an error.
    pub fn close_fd(&mut self, fd: i32) {
        if Self::is_valid_fd(fd) {
            self.files[fd as usize] = None;
        }
    }

    pub fn new_map_id(&mut self, first_upage: usize) -> i32 {
        let id = self.next_map_id;
        self.next_map_id += 1;
        self.mmaps.insert(id, first_upage);
        id
    }

    pub fn mmap_upage(&self, map_id: i32) -> Option<usize> {
        self.mmaps.get(&map_id).copied()
    }

    /// `munmap`: idempotent -- unmapping an unknown or already-unmapped
    /// id is a no-op.
    pub fn remove_mmap(&mut self, map_id: i32) -> Option<usize> {
        self.mmaps.remove(&map_id)
    }
}

/// The exact console line the original prints on every process
/// termination.
pub fn exit_message(progname: &str, status: i32) -> String {
    format!("{progname}: exit({status})\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_state_second_wait_returns_sentinel() {
        let state = ExitState::new();
        state.signal_exit(7);
        assert_eq!(state.wait(), 7);
        assert_eq!(state.wait(), -1);
    }

    #[test]
    fn exit_state_wait_blocks_until_signaled() {
        let state = Arc::new(ExitState::new());
        let state2 = state.clone();
        let handle = std::thread::spawn(move || state2.wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        state.signal_exit(42);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn fd_table_reserves_stdio_and_is_idempotent_on_close() {
        let mut p = Process::new(1, "prog arg1");
        assert_eq!(p.progname(), "prog");
        let file = Arc::new(File::new(Arc::new(crate::testkit::MemFile::from_bytes(b"x"))));
        let fd = p.open_fd(file).unwrap();
        assert!(fd >= 2);
        p.close_fd(fd);
        p.close_fd(fd); // no panic, no-op
        assert!(p.file(fd).is_none());
    }

    #[test]
    fn exit_message_matches_convention() {
        assert_eq!(exit_message("prog", -1), "prog: exit(-1)\n");
    }
}
