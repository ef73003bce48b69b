//! Fiber-swap foreign-loop adapter (E1).
//!
//! Runs an external event loop's blocking `run()` call on its own
//! stack (the "loop" context) and a stub poll-function hook that, each
//! time the foreign loop wants readiness on a set of descriptors,
//! records the request and switches back to the caller's stack (the
//! "main" context) instead of calling `poll(2)` itself. The main side
//! arms the requested descriptors on the ring, and once a completion
//! (or the loop's own timeout) arrives, fills in the readiness bitmap
//! and switches back into the loop, which returns from the stub as if
//! `poll(2)` itself had just returned.
//!
//! Exactly one of the two contexts is ever running; the two
//! `context_switch` call sites (`poll` and `FiberAdapter::jump_to_loop`)
//! are the only suspension points. Mirrors `FastGLoop`'s
//! `ucontext`-based GLib poll-function hook: `GPollFunc` takes no
//! userdata, so the original tracks "which loop is currently running"
//! in a `static __thread` pointer rather than a parameter; [`poll`]
//! does the same with [`CURRENT`], set for the duration the loop
//! context is live.

mod arch;
mod stack;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use ring_io::{Completion, Descriptor, Reason, Ring};

use crate::error::Result;
use arch::SavedRegs;
use stack::FiberStack;

thread_local! {
    /// The adapter whose loop context is currently live on this thread,
    /// if any. Set by `jump_to_loop` for exactly the duration the loop
    /// is running, mirroring `FastGLoop.c`'s `static __thread struct
    /// FastGLoop* state`: the foreign loop's poll-function hook (e.g.
    /// GLib's `GPollFunc`) has no userdata slot to carry an adapter
    /// handle through, so this is the only way [`poll`] can find its
    /// adapter.
    static CURRENT: Cell<*const FiberAdapter> = const { Cell::new(std::ptr::null()) };
}

/// Called by the foreign loop's poll-function hook, in place of its own
/// blocking wait, whenever it is running inside a [`FiberAdapter`]'s
/// loop context. Stashes `requests`/`timeout_ms`, yields to main, and
/// on resumption returns the number of ready descriptors (with
/// `revents` filled in on each).
///
/// # Panics
/// Panics if called outside an active `FiberAdapter` loop context.
pub fn poll(requests: &mut [PollRequest], timeout_ms: i32) -> i32 {
    let ptr = CURRENT.with(Cell::get);
    assert!(!ptr.is_null(), "ring_adapter::fiber::poll called outside an active FiberAdapter loop context");
    unsafe { &*ptr }.yield_to_main(requests, timeout_ms)
}

/// One descriptor the foreign loop wants readiness events for, in the
/// same shape as a `pollfd`/`GPollFD`: caller fills `fd`/`events`
/// before calling [`FiberAdapter::poll`], the adapter fills `revents`.
#[derive(Debug, Clone, Copy)]
pub struct PollRequest {
    pub fd: RawFd,
    pub events: u32,
    pub revents: u32,
}

#[derive(Default)]
struct FileState {
    /// Events requested so far this cycle.
    current: u32,
    /// Events the live descriptor (if any) was armed with.
    previous: u32,
    /// Cycle number this entry was last touched on, so a second
    /// request for the same fd within one cycle just ORs in more
    /// events instead of resetting `result`.
    cycle: u32,
    result: i32,
    descriptor: *mut Descriptor,
}

/// Drives one foreign event loop, kept alive on its own fiber, through
/// the ring's completion pump. Construct with [`FiberAdapter::new`];
/// the returned `Arc` must outlive the loop's `run` closure (it holds
/// the loop fiber's stack and saved registers).
pub struct FiberAdapter {
    ring: Arc<Ring>,
    main_regs: UnsafeCell<SavedRegs>,
    loop_regs: UnsafeCell<SavedRegs>,
    stack: FiberStack,
    entry: UnsafeCell<Option<Box<dyn FnMut()>>>,

    files: RefCell<Vec<FileState>>,
    cycle: Cell<u32>,
    timeout_descriptor: Cell<*mut Descriptor>,

    requested_timeout_ms: Cell<i32>,
    entries_ptr: Cell<*mut PollRequest>,
    entries_len: Cell<usize>,
    result: Cell<i32>,

    /// At most one flusher in flight at a time (mirrors `loop->condition`).
    scheduled: Cell<bool>,
    /// Set once the loop's `run` closure has returned for good.
    finished: Cell<bool>,
}

// The adapter's mutable state is only ever touched from the ring's
// owner thread: from `main`-side code between switches, or from
// `loop`-side code while `main` is suspended. Never both at once.
unsafe impl Send for FiberAdapter {}
unsafe impl Sync for FiberAdapter {}

impl FiberAdapter {
    /// `run` is the call that blocks inside the foreign loop (e.g. a
    /// `uv_run`/`g_main_loop_run` equivalent); it must call
    /// [`poll`] in place of that loop's own descriptor wait whenever it
    /// would otherwise block on I/O.
    pub fn new(ring: Arc<Ring>, stack_size: usize, run: impl FnMut() + 'static) -> Result<Arc<Self>> {
        let stack = FiberStack::new(stack_size)?;
        let adapter = Arc::new(Self {
            ring,
            main_regs: UnsafeCell::new(SavedRegs::default()),
            loop_regs: UnsafeCell::new(SavedRegs::default()),
            stack,
            entry: UnsafeCell::new(Some(Box::new(run))),
            files: RefCell::new(Vec::new()),
            cycle: Cell::new(0),
            timeout_descriptor: Cell::new(std::ptr::null_mut()),
            requested_timeout_ms: Cell::new(-1),
            entries_ptr: Cell::new(std::ptr::null_mut()),
            entries_len: Cell::new(0),
            result: Cell::new(0),
            scheduled: Cell::new(false),
            finished: Cell::new(false),
        });

        let top = adapter.stack.top();
        unsafe {
            arch::init_context(adapter.loop_regs.get(), top, run_entry as usize, Arc::as_ptr(&adapter) as usize);
        }

        adapter.jump_to_loop();
        if !adapter.finished.get() {
            Self::submit_requests(&adapter);
        }
        Ok(adapter)
    }

    /// The actual context-switch half of [`poll`]; split out so the
    /// free function can look up `self` via [`CURRENT`] without an
    /// embedder ever needing a `&FiberAdapter` of their own.
    fn yield_to_main(&self, requests: &mut [PollRequest], timeout_ms: i32) -> i32 {
        self.entries_ptr.set(requests.as_mut_ptr());
        self.entries_len.set(requests.len());
        self.requested_timeout_ms.set(timeout_ms);
        unsafe { arch::context_switch(self.loop_regs.get(), self.main_regs.get()) };
        self.result.get()
    }

    /// Switch into the loop context, with [`CURRENT`] set for exactly
    /// the duration it runs (mirrors `JumpToLoop`'s `state = loop; ...;
    /// state = NULL;` bracketing).
    fn jump_to_loop(&self) {
        CURRENT.with(|c| c.set(self as *const Self));
        unsafe { arch::context_switch(self.main_regs.get(), self.loop_regs.get()) };
        CURRENT.with(|c| c.set(std::ptr::null()));
    }

    /// Arm (or re-arm, if the interest mask changed) a ring poll for
    /// every fd the loop requested last time it called `poll`, plus
    /// its requested timeout. Mirrors `HandleRequest`.
    fn submit_requests(self: &Arc<Self>) {
        let len = self.entries_len.get();
        if len != 0 {
            let entries = unsafe { std::slice::from_raw_parts(self.entries_ptr.get(), len) };
            let cycle = self.cycle.get().wrapping_add(1);
            self.cycle.set(cycle);

            let mut touched: Vec<RawFd> = Vec::new();
            {
                let mut files = self.files.borrow_mut();
                for req in entries {
                    let fd = req.fd as usize;
                    if files.len() <= fd {
                        files.resize_with(fd + 1, FileState::default);
                    }
                    let data = &mut files[fd];
                    if data.cycle != cycle {
                        data.result = 0;
                        data.current = 0;
                        data.cycle = cycle;
                        touched.push(req.fd);
                    }
                    data.current |= req.events;
                }
            }

            for fd in touched {
                self.rearm_poll(fd);
            }
        }

        self.rearm_timeout();
    }

    fn rearm_poll(self: &Arc<Self>, fd: RawFd) {
        let mask = {
            let mut files = self.files.borrow_mut();
            let data = &mut files[fd as usize];
            if data.previous == data.current && !data.descriptor.is_null() {
                return;
            }
            if let Some(old) = non_null(data.descriptor) {
                let _ = self.ring.cancel(old);
                data.descriptor = std::ptr::null_mut();
            }
            data.current
        };

        let me = Arc::clone(self);
        if let Ok(d) = self.ring.arm_poll(fd, mask, false, Box::new(move |_d, completion, reason| me.on_poll_complete(fd, completion, reason))) {
            let mut files = self.files.borrow_mut();
            let data = &mut files[fd as usize];
            data.descriptor = d;
            data.previous = mask;
        }
    }

    fn rearm_timeout(self: &Arc<Self>) {
        if let Some(old) = non_null(self.timeout_descriptor.get()) {
            let _ = self.ring.cancel(old);
            self.timeout_descriptor.set(std::ptr::null_mut());
        }
        let timeout_ms = self.requested_timeout_ms.get();
        if timeout_ms < 0 {
            return;
        }
        let me = Arc::clone(self);
        if let Ok(d) = self.ring.arm_timeout(timeout_ms as u64, false, Box::new(move |_d, completion, reason| me.on_timeout_complete(completion, reason))) {
            self.timeout_descriptor.set(d);
        }
    }

    fn on_poll_complete(self: &Arc<Self>, fd: RawFd, completion: Option<Completion>, reason: Reason) -> u8 {
        if reason == Reason::Released {
            return 0;
        }
        let Some(completion) = completion else { return 0 };
        if completion.result == -libc::ECANCELED {
            return 0;
        }
        {
            let mut files = self.files.borrow_mut();
            if let Some(data) = files.get_mut(fd as usize) {
                data.result = completion.result;
                data.descriptor = std::ptr::null_mut();
            }
        }
        self.touch();
        0
    }

    fn on_timeout_complete(self: &Arc<Self>, completion: Option<Completion>, reason: Reason) -> u8 {
        if reason == Reason::Released {
            return 0;
        }
        let Some(completion) = completion else { return 0 };
        if completion.result == -libc::ECANCELED {
            return 0;
        }
        self.timeout_descriptor.set(std::ptr::null_mut());
        self.touch();
        0
    }

    /// Schedule a flush for the next cooperative drain, unless one is
    /// already pending (mirrors `TouchFastGLoop`'s `loop->condition`
    /// dedup: at most one flusher per tick).
    fn touch(self: &Arc<Self>) {
        if self.finished.get() || self.scheduled.replace(true) {
            return;
        }
        let me = Arc::clone(self);
        self.ring.schedule_flusher(Box::new(move |reason| me.flush(reason)));
    }

    /// Compute `revents` for every outstanding request, switch into
    /// the loop (which returns from its `poll()` call), then arm
    /// whatever the loop asks for next. Mirrors `HandleFlush`.
    fn flush(self: &Arc<Self>, reason: Reason) {
        self.scheduled.set(false);
        if reason != Reason::Complete || self.finished.get() {
            return;
        }

        let len = self.entries_len.get();
        if len != 0 {
            let entries = unsafe { std::slice::from_raw_parts_mut(self.entries_ptr.get(), len) };
            let files = self.files.borrow();
            let mut ready = 0i32;
            for req in entries.iter_mut() {
                let data = &files[req.fd as usize];
                let revents = if data.result > 0 { data.result as u32 } else { 0 } & req.events;
                req.revents = revents;
                ready += (revents != 0) as i32;
            }
            self.result.set(ready);
        } else {
            self.result.set(0);
        }
        self.entries_len.set(0);

        self.jump_to_loop();
        if !self.finished.get() {
            Self::submit_requests(self);
        }
    }

    /// Whether the loop's `run` closure has returned (the loop quit on
    /// its own, or the embedder arranged for it to). Once true,
    /// `poll`/`flush` will never be entered again.
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }
}

impl Drop for FiberAdapter {
    fn drop(&mut self) {
        let mut files = self.files.borrow_mut();
        for data in files.iter_mut() {
            if let Some(d) = non_null(data.descriptor) {
                let _ = self.ring.cancel(d);
            }
        }
        if let Some(d) = non_null(self.timeout_descriptor.get()) {
            let _ = self.ring.cancel(d);
        }
    }
}

fn non_null(p: *mut Descriptor) -> Option<*mut Descriptor> {
    if p.is_null() {
        None
    } else {
        Some(p)
    }
}

extern "C" fn run_entry(arg: usize) {
    let adapter = unsafe { &*(arg as *const FiberAdapter) };
    let entry = unsafe { (*adapter.entry.get()).take() };
    if let Some(mut f) = entry {
        f();
    }
}

/// Called from the trampoline when the loop's `run` closure returns
/// (the foreign loop quit). Marks the adapter finished and switches
/// back to main for good; never returns.
pub(crate) extern "C" fn loop_finished(arg: usize) {
    let adapter = unsafe { &*(arg as *const FiberAdapter) };
    adapter.finished.set(true);
    unsafe { arch::context_switch(adapter.loop_regs.get(), adapter.main_regs.get()) };
    unreachable!("fiber-swap loop context resumed after the loop already finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring_io::RingConfig;

    #[test]
    fn runs_the_loop_entry_and_one_poll_cycle_before_returning() {
        let ring = Arc::new(Ring::create(RingConfig::default()).unwrap());
        let cycles = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let cycles_clone = Arc::clone(&cycles);

        let (read_fd, write_fd) = pipe();
        let adapter = FiberAdapter::new(Arc::clone(&ring), 256 * 1024, move || {
            // A stand-in "foreign loop": ask once for POLLIN on the
            // pipe's read end, forever, counting how many times its
            // poll hook was asked to block. Calls the free `poll`
            // function exactly as real embedding glue would, with no
            // access to the adapter itself.
            loop {
                let mut reqs = [PollRequest { fd: read_fd, events: libc::POLLIN as u32, revents: 0 }];
                cycles_clone.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let ready = super::poll(&mut reqs, 1000);
                if ready > 0 {
                    break;
                }
            }
        })
        .unwrap();

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const _, 1);
        }
        for _ in 0..10 {
            if cycles.load(std::sync::atomic::Ordering::Relaxed) >= 2 {
                break;
            }
            ring.wait(50).unwrap();
        }

        assert!(cycles.load(std::sync::atomic::Ordering::Relaxed) >= 1);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        (fds[0], fds[1])
    }
}
