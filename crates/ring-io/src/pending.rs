//! The pending submission list: a multi-producer, single-consumer
//! intrusive queue. Producers atomically exchange the list's head with
//! their own node — equivalent to swapping in a fresh terminator — and
//! the owner thread periodically takes the whole chain and walks it in
//! submission order.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::descriptor::Descriptor;

pub struct PendingList {
    head: AtomicPtr<Descriptor>,
}

impl PendingList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Append `node` to the list. Safe to call from any thread; `node`
    /// must not be pushed again until it has been popped by `take_all`.
    pub fn push(&self, node: *mut Descriptor) {
        loop {
            let old = self.head.load(Ordering::Acquire);
            unsafe { (*node).pending_next().store(old, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(old, node, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Atomically detach the whole list and return it in submission
    /// (oldest-first) order. Single-consumer only.
    pub fn take_all(&self) -> PendingIter {
        let mut node = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let mut prev: *mut Descriptor = std::ptr::null_mut();
        while !node.is_null() {
            let next = unsafe { (*node).pending_next().load(Ordering::Relaxed) };
            unsafe { (*node).pending_next().store(prev, Ordering::Relaxed) };
            prev = node;
            node = next;
        }
        PendingIter { cur: prev }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Default for PendingList {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PendingIter {
    cur: *mut Descriptor,
}

impl Iterator for PendingIter {
    type Item = *mut Descriptor;

    fn next(&mut self) -> Option<*mut Descriptor> {
        if self.cur.is_null() {
            return None;
        }
        let node = self.cur;
        self.cur = unsafe { (*node).pending_next().load(Ordering::Relaxed) };
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_descriptor() -> *mut Descriptor {
        Box::into_raw(Box::new(Descriptor::new()))
    }

    unsafe fn reclaim(d: *mut Descriptor) {
        drop(Box::from_raw(d));
    }

    #[test]
    fn take_all_preserves_push_order() {
        let list = PendingList::new();
        let a = leak_descriptor();
        let b = leak_descriptor();
        let c = leak_descriptor();
        list.push(a);
        list.push(b);
        list.push(c);

        let drained: Vec<_> = list.take_all().collect();
        assert_eq!(drained, vec![a, b, c]);
        assert!(list.is_empty());

        unsafe {
            reclaim(a);
            reclaim(b);
            reclaim(c);
        }
    }

    #[test]
    fn requeue_after_partial_drain_restores_order() {
        let list = PendingList::new();
        let a = leak_descriptor();
        let b = leak_descriptor();
        let c = leak_descriptor();
        list.push(a);
        list.push(b);
        list.push(c);

        let mut iter = list.take_all();
        let first = iter.next().unwrap();
        assert_eq!(first, a);
        // Requeue the remainder (b, c) in the order we observed them.
        for remaining in iter {
            list.push(remaining);
        }

        let drained: Vec<_> = list.take_all().collect();
        assert_eq!(drained, vec![b, c]);

        unsafe {
            reclaim(a);
            reclaim(b);
            reclaim(c);
        }
    }
}
