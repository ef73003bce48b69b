//! A single mmap'd stack with a trailing guard page, for the loop
//! fiber's own call stack. Mirrors the teacher's slot-region mmap +
//! `mprotect` guard-page idiom, simplified to one stack instead of a
//! pool of slots since an adapter owns exactly one loop fiber.

const GUARD_SIZE: usize = 4096;

pub(crate) struct FiberStack {
    base: *mut u8,
    mapped_len: usize,
}

impl FiberStack {
    /// `usable_size` is rounded up to a page and does not include the
    /// guard page, which is appended on top.
    pub(crate) fn new(usable_size: usize) -> crate::error::Result<Self> {
        let page = page_size();
        let usable = (usable_size.max(page) + page - 1) & !(page - 1);
        let mapped_len = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(crate::error::AdapterError::StackAllocation(unsafe { *libc::__errno_location() }));
        }

        // Stacks on x86_64 grow down from `top()`, so the guard page
        // goes at the low end of the mapping: once the fiber consumes
        // the whole usable region it faults into PROT_NONE instead of
        // into whatever mapping happens to sit below us.
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, mapped_len) };
            return Err(crate::error::AdapterError::StackAllocation(unsafe { *libc::__errno_location() }));
        }

        Ok(Self { base: base as *mut u8, mapped_len })
    }

    /// Highest usable address, 16-byte aligned per the System V ABI
    /// (the fiber's own `init_context` does the final alignment trim).
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped_len) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.mapped_len) };
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
