//! Lock-free heap of reusable `Buffer`s. Mirrors the descriptor
//! allocator's free-stack-plus-retained-heap shape: a popped buffer
//! that's too small is grown in place rather than replaced, so a
//! caller's registration index (if any) survives reallocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ring_core::aba::AbaStack;
use ring_core::error::Result;

use crate::buffer::Buffer;

/// Implemented by whatever registers fixed buffers with a kernel ring
/// (`ring_io::registered::RegisteredBufferTable`). Kept as a trait here,
/// rather than a direct dependency on that concrete type, so this pool
/// has no opinion on which ring it backs.
pub trait BufferRegistrar: Send + Sync {
    fn register(&self, addr: *mut u8, len: usize) -> Result<usize>;
    fn update(&self, idx: usize, addr: *mut u8, len: usize) -> Result<()>;
    fn unregister(&self, idx: usize);
}

pub struct BufferPool {
    free: AbaStack<Buffer>,
    heap: Mutex<Vec<Box<Buffer>>>,
    default_capacity: usize,
    outstanding: AtomicUsize,
    registrar: Option<Arc<dyn BufferRegistrar>>,
}

impl BufferPool {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            free: AbaStack::new(),
            heap: Mutex::new(Vec::new()),
            default_capacity,
            outstanding: AtomicUsize::new(0),
            registrar: None,
        }
    }

    pub fn with_registrar(default_capacity: usize, registrar: Arc<dyn BufferRegistrar>) -> Self {
        Self {
            registrar: Some(registrar),
            ..Self::new(default_capacity)
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Acquire a buffer of at least `min_size` bytes, popping a free one
    /// and growing it if needed, or allocating fresh if the pool is
    /// empty. `register` additionally requests kernel registration for
    /// buffers that aren't already registered.
    pub fn acquire(&self, min_size: usize, register: bool) -> *mut Buffer {
        let min_size = min_size.max(self.default_capacity);
        let ptr = match self.free.pop() {
            Some(p) => p,
            None => {
                let mut heap = self.heap.lock().unwrap();
                let mut boxed = Buffer::with_capacity(min_size);
                let ptr: *mut Buffer = &mut *boxed;
                heap.push(boxed);
                ptr
            }
        };

        let buf = unsafe { &*ptr };
        if buf.capacity() < min_size {
            self.grow_buffer(buf, min_size);
        }
        buf.reset_for_allocation();
        if register {
            self.ensure_registered(buf);
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        ptr
    }

    fn grow_buffer(&self, buf: &Buffer, min_size: usize) {
        buf.grow(min_size);
        if let (Some(registrar), Some(idx)) = (&self.registrar, buf.registration_index()) {
            let _ = registrar.update(idx as usize, buf.as_mut_ptr(), buf.capacity());
        }
    }

    fn ensure_registered(&self, buf: &Buffer) {
        if buf.registration_index().is_some() {
            return;
        }
        if let Some(registrar) = &self.registrar {
            if let Ok(idx) = registrar.register(buf.as_mut_ptr(), buf.capacity()) {
                buf.set_registration_index(Some(idx as u32));
            }
        }
    }

    pub fn retain(&self, ptr: *mut Buffer) {
        unsafe { (*ptr).retain() };
    }

    /// Decrement refcount; at zero, return the buffer to the free heap
    /// and drop the pool's share of the outstanding count.
    pub fn release(&self, ptr: *mut Buffer) {
        let buf = unsafe { &*ptr };
        if buf.release_ref() {
            buf.advance_tag();
            unsafe { self.free.push(ptr) };
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        debug_assert_eq!(self.outstanding.load(Ordering::Acquire), 0, "buffer pool dropped with buffers still checked out");
        if let Some(registrar) = &self.registrar {
            for buf in self.heap.lock().unwrap().iter() {
                if let Some(idx) = buf.registration_index() {
                    registrar.unregister(idx as usize);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeRegistrar {
        next_idx: StdMutex<usize>,
        updates: StdMutex<Vec<(usize, usize)>>,
    }

    impl FakeRegistrar {
        fn new() -> Self {
            Self {
                next_idx: StdMutex::new(0),
                updates: StdMutex::new(Vec::new()),
            }
        }
    }

    impl BufferRegistrar for FakeRegistrar {
        fn register(&self, _addr: *mut u8, _len: usize) -> Result<usize> {
            let mut next = self.next_idx.lock().unwrap();
            let idx = *next;
            *next += 1;
            Ok(idx)
        }
        fn update(&self, idx: usize, _addr: *mut u8, len: usize) -> Result<()> {
            self.updates.lock().unwrap().push((idx, len));
            Ok(())
        }
        fn unregister(&self, _idx: usize) {}
    }

    #[test]
    fn acquire_release_recycles_through_the_free_heap() {
        let pool = BufferPool::new(64);
        let a = pool.acquire(64, false);
        pool.release(a);
        let b = pool.acquire(64, false);
        assert_eq!(a, b);
        pool.release(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn reacquiring_a_too_small_buffer_grows_it_in_place() {
        let pool = BufferPool::new(64);
        let a = pool.acquire(64, false);
        pool.release(a);
        let b = pool.acquire(4096, false);
        assert_eq!(a, b);
        assert_eq!(unsafe { (*b).capacity() }, 4096);
        pool.release(b);
    }

    #[test]
    fn registration_index_survives_growth_via_update_not_reregister() {
        let registrar = Arc::new(FakeRegistrar::new());
        let pool = BufferPool::with_registrar(64, registrar.clone());
        let a = pool.acquire(64, true);
        let idx = unsafe { (*a).registration_index() }.unwrap();
        pool.release(a);

        let b = pool.acquire(4096, true);
        assert_eq!(unsafe { (*b).registration_index() }, Some(idx));
        assert_eq!(registrar.updates.lock().unwrap().len(), 1);
        pool.release(b);
    }
}
