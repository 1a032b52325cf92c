//! In-memory reference implementations of the crate's boundary traits
//!
//! Mirrors `kernel/src/fs/blockdev.rs`'s `RamBlockDevice`: a small,
//! obviously-correct `Vec`-backed stand-in for a hardware collaborator,
//! kept out of the default build and pulled in only for tests (or by a
//! caller that opts in with the `testkit` feature, e.g. to prototype
//! against the crate without real hardware yet).

use std::collections::HashMap;
use std::sync::Mutex;

use std::sync::Arc;

use crate::fs::{BackingFile, FileSystem};
use crate::hw::{PageDirectory, PAGE_SIZE};
use crate::swap::{SwapBackend, SwapSlot};

/// A file backed by an in-memory byte buffer.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: Mutex::new(data.to_vec()),
        }
    }
}

impl BackingFile for MemFile {
    fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut data = self.data.lock().unwrap();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }
}

/// A directory namespace backed by a `HashMap` of named in-memory files.
#[derive(Default)]
pub struct MemFileSystem {
    files: Mutex<HashMap<String, Arc<MemFile>>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSystem for MemFileSystem {
    fn create(&self, name: &str, size: usize) -> bool {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(name) {
            return false;
        }
        files.insert(name.to_string(), Arc::new(MemFile::from_bytes(&vec![0u8; size])));
        true
    }

    fn remove(&self, name: &str) -> bool {
        self.files.lock().unwrap().remove(name).is_some()
    }

    fn open(&self, name: &str) -> Option<Arc<dyn BackingFile>> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .map(|f| f as Arc<dyn BackingFile>)
    }
}

/// A swap device backed by a flat in-memory buffer of slots.
pub struct MemSwapBackend {
    slots: Mutex<Vec<[u8; PAGE_SIZE]>>,
}

impl MemSwapBackend {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: Mutex::new(vec![[0u8; PAGE_SIZE]; slot_count]),
        }
    }
}

impl SwapBackend for MemSwapBackend {
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    fn write_slot(&self, slot: SwapSlot, data: &[u8; PAGE_SIZE]) {
        self.slots.lock().unwrap()[slot.0] = *data;
    }

    fn read_slot(&self, slot: SwapSlot, data: &mut [u8; PAGE_SIZE]) {
        *data = self.slots.lock().unwrap()[slot.0];
    }
}

#[derive(Default, Clone, Copy)]
struct Pte {
    frame_addr: usize,
    writable: bool,
    dirty: bool,
    accessed: bool,
}

/// A page directory backed by a `HashMap`, with dirty/accessed bits the
/// test can set directly to drive the eviction algorithm down a specific
/// path.
#[derive(Default)]
pub struct MemPageDirectory {
    entries: HashMap<usize, Pte>,
}

impl MemPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageDirectory for MemPageDirectory {
    fn install_page(&mut self, upage: usize, frame_addr: usize, writable: bool) -> bool {
        self.entries.insert(
            upage,
            Pte {
                frame_addr,
                writable,
                dirty: false,
                accessed: false,
            },
        );
        true
    }

    fn get_page(&self, upage: usize) -> Option<usize> {
        self.entries.get(&upage).map(|e| e.frame_addr)
    }

    fn clear_page(&mut self, upage: usize) {
        self.entries.remove(&upage);
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entries.get(&upage).is_some_and(|e| e.dirty)
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entries.get(&upage).is_some_and(|e| e.accessed)
    }

    fn set_dirty(&mut self, upage: usize, value: bool) {
        if let Some(e) = self.entries.get_mut(&upage) {
            e.dirty = value;
        }
    }

    fn set_accessed(&mut self, upage: usize, value: bool) {
        if let Some(e) = self.entries.get_mut(&upage) {
            e.accessed = value;
        }
    }
}

/// The load/ack/terminated rendezvous `process.rs`'s `Semaphore` normally
/// provides, collapsed to plain function calls for tests that only need
/// a single thread of control and don't want to block on a condvar.
#[derive(Default)]
pub struct InlineThreadHandoff {
    signaled: Mutex<bool>,
}

impl InlineThreadHandoff {
    pub fn new() -> Self {
        Self::default()
    }
}

impl crate::process::ThreadHandoff for InlineThreadHandoff {
    fn signal(&self) {
        *self.signaled.lock().unwrap() = true;
    }

    fn wait(&self) {
        assert!(
            *self.signaled.lock().unwrap(),
            "InlineThreadHandoff::wait called before signal -- no scheduler to block on"
        );
    }
}
