//! Demand-paged virtual memory
//!
//! A hosted reimplementation of a Pintos-style VM subsystem: a
//! supplemental page table that distinguishes anonymous, file-backed and
//! mmap'd pages; a frame table that evicts by an enhanced second-chance
//! scan; a bitmap swap allocator; the stack-growth heuristic and ceiling;
//! and a syscall dispatcher over all of it.
//!
//! Hardware, the scheduler, the real filesystem and process loading are
//! all out of this crate's scope -- [`hw::PageDirectory`], [`fs::BackingFile`],
//! [`fs::FileSystem`], [`swap::SwapBackend`], [`process::ThreadHandoff`] and
//! [`process::ProcessEnv`] are the seams a caller plugs its own
//! implementations into. [`testkit`] has in-memory reference
//! implementations of each, used by this crate's own tests.
#![forbid(unsafe_code)]

pub mod error;
pub mod frame;
pub mod fs;
pub mod hw;
pub mod process;
pub mod spt;
pub mod stack;
pub mod swap;
pub mod syscall;
pub mod validate;
pub mod vm;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use error::{VmError, VmResult};
pub use vm::VmSubsystem;
