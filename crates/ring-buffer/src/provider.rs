//! Kernel-shared buffer-ring provider (`IORING_REGISTER_PBUF_RING`): a
//! producer ring of buffer addresses the kernel consumes from on
//! `IOSQE_BUFFER_SELECT` receives, identified by a buffer group id.

use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types::BufRingEntry;
use io_uring::IoUring;

use ring_core::error::{Result, RingError};

/// Owns the mmap'd ring of `io_uring_buf` entries and the userspace
/// buffers currently described by it. `factory` produces a fresh buffer
/// whenever a consumed slot needs refilling.
pub struct BufferRingProvider<F: Fn(usize) -> Box<[u8]>> {
    ring_addr: *mut libc::c_void,
    ring_len: usize,
    mask: u16,
    group_id: u16,
    buffer_len: usize,
    tail: u16,
    slots: Vec<Option<Box<[u8]>>>,
    factory: F,
}

unsafe impl<F: Fn(usize) -> Box<[u8]> + Send> Send for BufferRingProvider<F> {}

impl<F: Fn(usize) -> Box<[u8]>> BufferRingProvider<F> {
    /// `group_id` of 0 asks the kernel to assign one; callers that need
    /// a specific id (to match an already-armed recv) pass it directly.
    pub fn create(ring: &IoUring, group_id: u16, count: u16, buffer_len: usize, factory: F) -> Result<Self> {
        let entries = count.max(1).next_power_of_two();
        let ring_len = entries as usize * std::mem::size_of::<BufRingEntry>();

        let ring_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ring_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ring_addr == libc::MAP_FAILED {
            return Err(RingError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)));
        }

        // Safety: `ring_addr` stays mapped for this provider's lifetime
        // and is never handed to another bgid before being unregistered
        // in `Drop`, satisfying the kernel's registration contract.
        let registered = unsafe { ring.submitter().register_buf_ring(ring_addr as u64, entries, group_id) };
        if let Err(e) = registered {
            unsafe { libc::munmap(ring_addr, ring_len) };
            return Err(RingError::RegistrationFailed(e.raw_os_error().unwrap_or(-1)));
        }

        let mut provider = Self {
            ring_addr,
            ring_len,
            mask: entries - 1,
            group_id,
            buffer_len,
            tail: 0,
            slots: (0..entries).map(|_| None).collect(),
            factory,
        };

        for bid in 0..entries {
            let buf = (provider.factory)(buffer_len);
            provider.push(bid, buf);
        }
        provider.publish();

        Ok(provider)
    }

    fn entry_mut(&self, index: u16) -> &mut BufRingEntry {
        let base = self.ring_addr as *mut BufRingEntry;
        unsafe { &mut *base.add(index as usize) }
    }

    fn push(&mut self, bid: u16, mut buf: Box<[u8]>) {
        let idx = self.tail & self.mask;
        let addr = buf.as_mut_ptr();
        let len = buf.len() as u32;
        {
            let entry = self.entry_mut(idx);
            entry.set_addr(addr as u64);
            entry.set_len(len);
            entry.set_bid(bid);
        }
        self.slots[bid as usize] = Some(buf);
        self.tail = self.tail.wrapping_add(1);
    }

    fn publish(&self) {
        let base = self.ring_addr as *const BufRingEntry;
        let shared_tail = unsafe { BufRingEntry::tail(base) } as *const AtomicU16;
        unsafe { (*shared_tail).store(self.tail, Ordering::Release) };
    }

    /// Take ownership of the buffer the kernel selected for a
    /// completion carrying `CQE_F_BUFFER` with this buffer id, leaving
    /// its slot empty until [`Self::advance`] refills it.
    ///
    /// # Safety
    /// `bid` must be a buffer id the kernel actually returned in a CQE
    /// for this group, and must not already have been taken.
    pub unsafe fn take(&mut self, bid: u16) -> Box<[u8]> {
        self.slots[bid as usize].take().expect("buffer id already taken")
    }

    /// Refill `bid` with a freshly produced buffer and publish it at
    /// the ring tail, returning the slot to the kernel.
    pub fn advance(&mut self, bid: u16) {
        let buf = (self.factory)(self.buffer_len);
        self.push(bid, buf);
        self.publish();
    }

    pub fn group_id(&self) -> u16 {
        self.group_id
    }
}

impl<F: Fn(usize) -> Box<[u8]>> Drop for BufferRingProvider<F> {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ring_addr, self.ring_len) };
    }
}

/// Object-safe facade over `BufferRingProvider<F>`, so a socket can hold
/// one behind a trait object without fixing the factory closure's type.
pub trait ProvidedBuffers: Send {
    /// # Safety
    /// Same contract as [`BufferRingProvider::take`].
    unsafe fn take(&mut self, bid: u16) -> Box<[u8]>;
    fn advance(&mut self, bid: u16);
    fn group_id(&self) -> u16;
}

impl<F: Fn(usize) -> Box<[u8]> + Send> ProvidedBuffers for BufferRingProvider<F> {
    unsafe fn take(&mut self, bid: u16) -> Box<[u8]> {
        BufferRingProvider::take(self, bid)
    }

    fn advance(&mut self, bid: u16) {
        BufferRingProvider::advance(self, bid)
    }

    fn group_id(&self) -> u16 {
        self.group_id
    }
}
