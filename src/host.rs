use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::*;
use parking_lot::Mutex;

use crate::request::{BufferHandle, HostRequest};
use crate::scheduler::HostInterface;

/// Host memory as a table of byte vectors, one per handle.
#[derive(Default)]
pub struct MemoryHost {
    buffers: Mutex<HashMap<BufferHandle, Vec<u8>>>,
    next: AtomicU64,
    completed: Mutex<Vec<u64>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// New zero-filled buffer of `len` bytes.
    pub fn alloc(&self, len: usize) -> BufferHandle {
        self.insert(vec![0; len])
    }

    pub fn insert(&self, data: Vec<u8>) -> BufferHandle {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().insert(handle, data);
        handle
    }

    pub fn get(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.buffers.lock().get(&handle).cloned()
    }

    pub fn free(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.buffers.lock().remove(&handle)
    }

    /// Sequence numbers in the order their requests completed.
    pub fn completed(&self) -> Vec<u64> {
        self.completed.lock().clone()
    }
}

impl HostInterface for MemoryHost {
    fn copy_from_host(&self, handle: BufferHandle, offset: usize, out: &mut [u8]) {
        match self.buffers.lock().get(&handle) {
            Some(data) if offset + out.len() <= data.len() => out.copy_from_slice(&data[offset..offset + out.len()]),
            _ => {
                warn!("host buffer {} has no bytes {}..{}", handle, offset, offset + out.len());
                out.fill(0);
            }
        }
    }

    fn copy_to_host(&self, handle: BufferHandle, offset: usize, data: &[u8]) {
        match self.buffers.lock().get_mut(&handle) {
            Some(buf) if offset + data.len() <= buf.len() => buf[offset..offset + data.len()].copy_from_slice(data),
            _ => warn!("host buffer {} has no room for bytes {}..{}", handle, offset, offset + data.len()),
        }
    }

    fn request_completed(&self, req: &HostRequest) {
        self.completed.lock().push(req.seq());
    }
}
