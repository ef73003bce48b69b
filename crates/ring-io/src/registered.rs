//! Registered-file and registered-buffer tables. Registration is rare
//! (per the concurrency model, §5) so these are plain mutex-guarded
//! tables rather than lock-free structures, mirroring the original's
//! pthread-mutex-guarded `FastRingFileList` / `FastRingBufferList`.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use ring_core::error::{Result, RingError};

/// Sparse table of kernel-registered file descriptors. Half the slots
/// are reserved so the kernel can allocate direct-descriptor indices on
/// demand (`IORING_FILE_INDEX_ALLOC`), per the ring's construction
/// policy in §6.
pub struct RegisteredFileTable {
    slots: Mutex<Vec<Option<RawFd>>>,
    reserved_from: usize,
}

impl RegisteredFileTable {
    pub fn new(capacity: usize) -> Self {
        let reserved_from = capacity / 2;
        Self {
            slots: Mutex::new(vec![None; capacity]),
            reserved_from,
        }
    }

    /// Register `fd` at the first free slot in the non-reserved half.
    /// Returns the slot index.
    pub fn register(&self, fd: RawFd) -> Result<usize> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots[..self.reserved_from]
            .iter()
            .position(|s| s.is_none())
            .ok_or(RingError::ResourceExhausted)?;
        slots[idx] = Some(fd);
        Ok(idx)
    }

    pub fn unregister(&self, idx: usize) -> Option<RawFd> {
        let mut slots = self.slots.lock().unwrap();
        slots.get_mut(idx).and_then(|s| s.take())
    }

    pub fn get(&self, idx: usize) -> Option<RawFd> {
        self.slots.lock().unwrap().get(idx).copied().flatten()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// Entry in the registered-buffer table: a fixed-buffer iovec slot the
/// kernel can reference by index instead of by address.
#[derive(Debug, Clone, Copy)]
pub struct RegisteredBufferSlot {
    pub addr: *mut u8,
    pub len: usize,
}

unsafe impl Send for RegisteredBufferSlot {}

pub struct RegisteredBufferTable {
    slots: Mutex<Vec<Option<RegisteredBufferSlot>>>,
}

impl RegisteredBufferTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    pub fn register(&self, addr: *mut u8, len: usize) -> Result<usize> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(RingError::ResourceExhausted)?;
        slots[idx] = Some(RegisteredBufferSlot { addr, len });
        Ok(idx)
    }

    pub fn unregister(&self, idx: usize) -> Option<RegisteredBufferSlot> {
        let mut slots = self.slots.lock().unwrap();
        slots.get_mut(idx).and_then(|s| s.take())
    }

    /// Re-point an already-registered slot at a grown allocation without
    /// changing its index, for the buffer pool's grow-in-place path.
    pub fn update(&self, idx: usize, addr: *mut u8, len: usize) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(idx).ok_or(RingError::ResourceExhausted)?;
        *slot = Some(RegisteredBufferSlot { addr, len });
        Ok(())
    }

    pub fn get(&self, idx: usize) -> Option<RegisteredBufferSlot> {
        self.slots.lock().unwrap().get(idx).copied().flatten()
    }
}
