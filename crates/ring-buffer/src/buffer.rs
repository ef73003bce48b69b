//! Refcounted, page-aligned I/O buffer. The header rides the same ABA
//! tag discipline as the descriptor free stack; the payload lives in a
//! separate allocation so growing a reused slot doesn't move the
//! header (and therefore doesn't invalidate any pointer a caller holds).

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ring_core::aba::AbaLinked;

const DATA_ALIGN: usize = 4096;

fn layout_for(capacity: usize) -> Layout {
    Layout::from_size_align(capacity.max(1), DATA_ALIGN).expect("buffer layout overflow")
}

#[repr(align(512))]
pub struct Buffer {
    next: AtomicU64,
    refcount: AtomicU32,
    tag: Cell<u8>,
    capacity: Cell<usize>,
    length: Cell<usize>,
    registration_index: Cell<Option<u32>>,
    data: Cell<*mut u8>,
}

// Safety: all non-atomic fields are documented as owned-thread-only
// except through the pool's `acquire`/`release` pair, which establishes
// exclusive access the same way the descriptor allocator does.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl AbaLinked for Buffer {
    fn next_link(&self) -> &AtomicU64 {
        &self.next
    }
}

impl Buffer {
    pub(crate) fn with_capacity(capacity: usize) -> Box<Self> {
        let layout = layout_for(capacity);
        let data = unsafe { alloc(layout) };
        assert!(!data.is_null(), "buffer allocation failed");
        Box::new(Self {
            next: AtomicU64::new(0),
            refcount: AtomicU32::new(1),
            tag: Cell::new(0),
            capacity: Cell::new(capacity),
            length: Cell::new(0),
            registration_index: Cell::new(None),
            data: Cell::new(data),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.length.get()
    }

    pub fn is_empty(&self) -> bool {
        self.length.get() == 0
    }

    pub fn set_len(&self, len: usize) {
        debug_assert!(len <= self.capacity.get());
        self.length.set(len);
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.get()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.data.get()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.get(), self.length.get()) }
    }

    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.get(), self.capacity.get()) }
    }

    pub fn registration_index(&self) -> Option<u32> {
        self.registration_index.get()
    }

    pub(crate) fn set_registration_index(&self, idx: Option<u32>) {
        self.registration_index.set(idx);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the refcount; returns true if it reached zero.
    pub(crate) fn release_ref(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn reset_for_allocation(&self) {
        self.refcount.store(1, Ordering::Release);
        self.length.set(0);
    }

    pub(crate) fn advance_tag(&self) {
        self.tag.set(self.tag.get().wrapping_add(1) & 0x3f);
    }

    /// Drop the current backing allocation and replace it with a fresh
    /// one of `new_capacity` bytes. Any kernel registration must be
    /// re-pointed by the caller (see `BufferPool::grow_buffer`).
    pub(crate) fn grow(&self, new_capacity: usize) {
        let old_layout = layout_for(self.capacity.get());
        unsafe { dealloc(self.data.get(), old_layout) };
        let new_layout = layout_for(new_capacity);
        let fresh = unsafe { alloc(new_layout) };
        assert!(!fresh.is_null(), "buffer growth allocation failed");
        self.data.set(fresh);
        self.capacity.set(new_capacity);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let layout = layout_for(self.capacity.get());
        unsafe { dealloc(self.data.get(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_starts_empty_with_refcount_one() {
        let buf = Buffer::with_capacity(128);
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.refcount(), 1);
        assert!(buf.registration_index().is_none());
    }

    #[test]
    fn grow_preserves_header_identity_and_updates_capacity() {
        let buf = Buffer::with_capacity(64);
        let header_addr = &*buf as *const Buffer;
        buf.grow(4096);
        assert_eq!(&*buf as *const Buffer, header_addr);
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn release_ref_reaches_zero_only_after_matching_retains() {
        let buf = Buffer::with_capacity(64);
        buf.retain();
        assert!(!buf.release_ref());
        assert!(buf.release_ref());
    }
}
