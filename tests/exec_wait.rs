//! A parent execs a child, waits for its exit status, and a second wait
//! on the same pid returns the sentinel.
//!
//! There is no real loader or scheduler in this crate (see `ProcessEnv`'s
//! doc comment in `src/process.rs`), so this test's `FakeEnv` models
//! "child 7" running to completion and exiting with status 7
//! synchronously, in place of an actual child address space.

use std::collections::HashMap;
use std::sync::Arc;

use uvm_core::process::{ExitState, ProcessEnv};

struct FakeEnv {
    children: HashMap<i32, Arc<ExitState>>,
    next_pid: i32,
}

impl FakeEnv {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            next_pid: 2,
        }
    }
}

impl ProcessEnv for FakeEnv {
    fn exec(&mut self, cmdline: &str) -> i32 {
        let status: i32 = cmdline
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(-1);
        let pid = self.next_pid;
        self.next_pid += 1;
        let exit_state = Arc::new(ExitState::new());
        exit_state.signal_exit(status);
        self.children.insert(pid, exit_state);
        pid
    }

    fn wait(&mut self, pid: i32) -> i32 {
        match self.children.get(&pid) {
            Some(state) => state.wait(),
            None => -1,
        }
    }
}

#[test]
fn exec_then_wait_returns_status_and_then_sentinel() {
    let mut env = FakeEnv::new();
    let pid = env.exec("child 7");
    assert_eq!(env.wait(pid), 7);
    assert_eq!(env.wait(pid), -1);
}
