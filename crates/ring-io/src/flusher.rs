//! One-shot post-completion tasks, drained at the end of every `wait()`
//! cycle. Backed by two ABA-tagged stacks so a flusher that itself
//! schedules a new flusher (common for re-entrant cancellation paths)
//! defers to the *next* cycle rather than being picked up by the drain
//! that is already in progress.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ring_core::aba::{AbaLinked, AbaStack};

use crate::descriptor::Reason;

#[repr(align(512))]
pub struct Flusher {
    next: AtomicU64,
    task: UnsafeCell<Option<Box<dyn FnOnce(Reason)>>>,
}

unsafe impl Send for Flusher {}
unsafe impl Sync for Flusher {}

impl AbaLinked for Flusher {
    fn next_link(&self) -> &AtomicU64 {
        &self.next
    }
}

impl Flusher {
    pub fn new(task: Box<dyn FnOnce(Reason)>) -> Box<Self> {
        Box::new(Self {
            next: AtomicU64::new(0),
            task: UnsafeCell::new(Some(task)),
        })
    }

    fn run(&self, reason: Reason) {
        if let Some(task) = unsafe { (*self.task.get()).take() } {
            task(reason);
        }
    }
}

pub struct FlusherStacks {
    stacks: [AbaStack<Flusher>; 2],
    active: AtomicUsize,
}

impl FlusherStacks {
    pub const fn new() -> Self {
        Self {
            stacks: [AbaStack::new(), AbaStack::new()],
            active: AtomicUsize::new(0),
        }
    }

    /// Schedule `node` for the *next* drain.
    pub fn push(&self, node: *mut Flusher) {
        let idx = self.active.load(Ordering::Acquire) & 1;
        unsafe { self.stacks[idx].push(node) };
    }

    /// Run every flusher that was pending at the moment this call
    /// began. Flushers scheduled by those callbacks land in the other
    /// stack and run on the next drain instead.
    pub fn drain(&self, reason: Reason) {
        let idx = self.active.fetch_xor(1, Ordering::AcqRel) & 1;
        while let Some(node) = self.stacks[idx].pop() {
            let flusher = unsafe { Box::from_raw(node) };
            flusher.run(reason);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stacks[0].is_empty() && self.stacks[1].is_empty()
    }
}

impl Default for FlusherStacks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn drain_runs_only_flushers_scheduled_before_the_call() {
        let stacks = FlusherStacks::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let ran = Arc::clone(&ran);
            stacks.push(Box::into_raw(Flusher::new(Box::new(move |_| ran.lock().unwrap().push(i)))));
        }

        // A flusher that reschedules itself should land in the next
        // cycle's stack, not re-run in this drain.
        let ran_reentrant = Arc::clone(&ran);
        let rescheduled = Arc::new(Mutex::new(false));
        let rescheduled_clone = Arc::clone(&rescheduled);
        stacks.push(Box::into_raw(Flusher::new(Box::new(move |_| {
            ran_reentrant.lock().unwrap().push(99);
            *rescheduled_clone.lock().unwrap() = true;
        }))));

        stacks.drain(Reason::Complete);
        assert_eq!(*ran.lock().unwrap(), vec![0, 1, 2, 99]);
        assert!(stacks.is_empty());
    }

    #[test]
    fn reentrant_push_during_drain_waits_for_next_cycle() {
        let stacks = Arc::new(FlusherStacks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let stacks_clone = Arc::clone(&stacks);
        let order_clone = Arc::clone(&order);
        stacks.push(Box::into_raw(Flusher::new(Box::new(move |_| {
            order_clone.lock().unwrap().push("first");
            let order_inner = Arc::clone(&order_clone);
            stacks_clone.push(Box::into_raw(Flusher::new(Box::new(move |_| {
                order_inner.lock().unwrap().push("second");
            }))));
        }))));

        stacks.drain(Reason::Complete);
        assert_eq!(*order.lock().unwrap(), vec!["first"]);

        stacks.drain(Reason::Complete);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
