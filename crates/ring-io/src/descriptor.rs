//! The submission-slot record: the one thing every component in this
//! workspace allocates, prepares, submits and releases.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use ring_core::aba::AbaLinked;
use ring_core::token::{IdentityToken, OPTION_MASK};

/// Why a descriptor's callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// A CQE arrived for this descriptor.
    Complete,
    /// A multi-shot descriptor's kernel-side term signaled no more CQEs
    /// are coming despite the callback wanting to continue.
    Incomplete,
    /// The ring is being torn down; `completion` is always `None`.
    Released,
}

/// `Free → Allocated → Pending → Submitted → (Free)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Free = 0,
    Allocated = 1,
    Pending = 2,
    Submitted = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Free,
            1 => State::Allocated,
            2 => State::Pending,
            _ => State::Submitted,
        }
    }
}

/// A completed-operation view handed to the callback: the CQE result
/// and flags, already detached from the kernel's completion queue.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub result: i32,
    pub flags: u32,
}

pub type Callback = dyn FnMut(&Descriptor, Option<Completion>, Reason) -> u8;

/// The per-opcode auxiliary data a descriptor carries. This is the
/// capability-tagged variant that stands in for the original's
/// function-pointer-plus-closure dispatch table (see the design notes).
pub enum Payload {
    Nop,
    Poll { fd: i32, mask: u32, multishot: bool },
    PollRemove { target: IdentityToken },
    Timeout { due_ms: u64, multishot: bool, ts: Box<io_uring::types::Timespec> },
    TimeoutRemove { target: IdentityToken },
    Cancel { target: IdentityToken },
    Recv { buf_group: u16 },
    Send,
    MsgRing { target_fd: i32, data: u64 },
    FutexWait { value: u64, mask: u64 },
    FutexWake { mask: u64 },
    Opaque,
}

/// An allocated submission slot. Aligned so its address can carry an
/// ABA tag and a rolling integrity tag in its low bits.
#[repr(align(512))]
pub struct Descriptor {
    pub(crate) free_next: AtomicU64,
    pending_next: AtomicPtr<Descriptor>,
    state: AtomicU8,
    refcount: AtomicU32,
    tag: Cell<u8>,
    options: Cell<u64>,
    /// Number of descriptors from this one (inclusive) that must land in
    /// the kernel in the same submit window (an IOSQE_IO_LINK chain).
    linked_count: Cell<u32>,
    /// Successor in a link chain, set up by the caller before submit.
    chain_next: Cell<*mut Descriptor>,
    pub(crate) payload: UnsafeCell<Payload>,
    pub(crate) sqe: UnsafeCell<Option<io_uring::squeue::Entry>>,
    callback: UnsafeCell<Option<Box<Callback>>>,
}

// Safety: descriptors move between the owner thread and the lock-free
// free/pending/flusher lists; all mutable access outside atomics is
// documented as owner-thread-only.
unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}

impl AbaLinked for Descriptor {
    fn next_link(&self) -> &AtomicU64 {
        &self.free_next
    }
}

impl Descriptor {
    pub(crate) fn new() -> Self {
        Self {
            free_next: AtomicU64::new(0),
            pending_next: AtomicPtr::new(std::ptr::null_mut()),
            state: AtomicU8::new(State::Free as u8),
            refcount: AtomicU32::new(0),
            tag: Cell::new(0),
            options: Cell::new(0),
            linked_count: Cell::new(1),
            chain_next: Cell::new(std::ptr::null_mut()),
            payload: UnsafeCell::new(Payload::Nop),
            sqe: UnsafeCell::new(None),
            callback: UnsafeCell::new(None),
        }
    }

    pub(crate) fn pending_next(&self) -> &AtomicPtr<Descriptor> {
        &self.pending_next
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
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

    pub(crate) fn reset_for_allocation(&self, callback: Box<Callback>) {
        self.refcount.store(1, Ordering::Release);
        self.linked_count.set(1);
        self.chain_next.set(std::ptr::null_mut());
        self.options.set(0);
        unsafe {
            *self.payload.get() = Payload::Nop;
            *self.sqe.get() = None;
            *self.callback.get() = Some(callback);
        }
        self.set_state(State::Allocated);
    }

    pub fn identity(&self) -> IdentityToken {
        IdentityToken::new(self as *const Descriptor as usize, self.tag.get(), self.options.get())
    }

    pub(crate) fn current_tag(&self) -> u8 {
        self.tag.get()
    }

    pub(crate) fn advance_tag(&self) {
        self.tag.set(IdentityToken::next_tag(self.tag.get()));
    }

    pub fn set_options(&self, options: u64) {
        self.options.set(options & OPTION_MASK);
    }

    pub fn linked_count(&self) -> u32 {
        self.linked_count.get()
    }

    pub fn set_linked_count(&self, n: u32) {
        self.linked_count.set(n.max(1));
    }

    pub fn chain_next(&self) -> *mut Descriptor {
        self.chain_next.get()
    }

    pub fn set_chain_next(&self, next: *mut Descriptor) {
        self.chain_next.set(next);
    }

    pub fn set_payload(&self, payload: Payload) {
        unsafe { *self.payload.get() = payload };
    }

    pub fn set_sqe(&self, sqe: io_uring::squeue::Entry) {
        unsafe { *self.sqe.get() = Some(sqe.user_data(self.identity().raw())) };
    }

    pub(crate) fn take_sqe(&self) -> Option<io_uring::squeue::Entry> {
        unsafe { (*self.sqe.get()).take() }
    }

    /// Invoke the callback, if one is still attached. Returns the
    /// callback's verdict (1 = keep alive, 0 = may release at refcount
    /// zero), or 0 if no callback is attached.
    pub(crate) fn invoke(&self, completion: Option<Completion>, reason: Reason) -> u8 {
        let slot = unsafe { &mut *self.callback.get() };
        match slot {
            Some(cb) => cb(self, completion, reason),
            None => 0,
        }
    }

    pub(crate) fn clear_callback(&self) {
        unsafe { *self.callback.get() = None };
    }

    /// Move the callback out, leaving the descriptor with none attached.
    /// Used to hand an in-flight op's callback to its replacement
    /// descriptor (poll-modify's cancel-then-rearm).
    pub(crate) fn take_callback(&self) -> Option<Box<Callback>> {
        unsafe { (*self.callback.get()).take() }
    }
}
