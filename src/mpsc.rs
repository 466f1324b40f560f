// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

//! The remote scheduling queue: a lock-free multi-producer LIFO drained
//! in one shot by the loop thread. The queue distinguishes "empty" from
//! "empty and the consumer is parked"; the parked state is encoded by
//! storing the address of the head field itself, which can never collide
//! with the address of a real operation.

use std::ptr;
use std::sync::atomic::{
    AtomicPtr,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

use crate::intrusive::{OpQueue, OpStack};
use crate::op::OpHeader;

pub(crate) struct AtomicOpQueue {
    head: AtomicPtr<OpHeader>,
}

impl AtomicOpQueue {
    /// A new queue starts active: the consumer is assumed to be running.
    pub(crate) fn new() -> AtomicOpQueue {
        AtomicOpQueue {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn inactive_value(&self) -> *mut OpHeader {
        ptr::from_ref(&self.head).cast_mut().cast::<OpHeader>()
    }

    /// Pushes `item`. Returns true iff the consumer was parked, in which
    /// case the producer owns waking it.
    pub(crate) unsafe fn enqueue(&self, item: *mut OpHeader) -> bool {
        let inactive = self.inactive_value();
        let mut old_head = self.head.load(Relaxed);

        loop {
            (*item).next = if old_head == inactive {
                ptr::null_mut()
            } else {
                old_head
            };

            match self.head.compare_exchange_weak(old_head, item, AcqRel, Relaxed) {
                Ok(_) => return old_head == inactive,
                Err(p) => old_head = p,
            }
        }
    }

    /// Pushes `item` unless the consumer is parked; a parked consumer is
    /// instead flipped back to active and the caller keeps the item.
    /// Returns true iff the item was enqueued.
    #[allow(dead_code)]
    pub(crate) unsafe fn enqueue_or_mark_active(&self, item: *mut OpHeader) -> bool {
        let inactive = self.inactive_value();
        let mut old_head = self.head.load(Relaxed);

        loop {
            let new_head = if old_head == inactive {
                ptr::null_mut()
            } else {
                (*item).next = old_head;
                item
            };

            match self
                .head
                .compare_exchange_weak(old_head, new_head, AcqRel, Relaxed)
            {
                Ok(_) => return old_head != inactive,
                Err(p) => old_head = p,
            }
        }
    }

    /// Flips a parked queue back to active. Fails if anything was
    /// enqueued in the meantime.
    #[allow(dead_code)]
    pub(crate) fn mark_active(&self) -> bool {
        let inactive = self.inactive_value();
        self.head
            .compare_exchange(inactive, ptr::null_mut(), Acquire, Relaxed)
            .is_ok()
    }

    /// Parks an empty queue. Fails if the queue holds items.
    pub(crate) fn mark_inactive(&self) -> bool {
        let inactive = self.inactive_value();
        let old_head = self.head.load(Relaxed);

        if old_head.is_null() {
            if self
                .head
                .compare_exchange(ptr::null_mut(), inactive, Release, Relaxed)
                .is_ok()
            {
                return true;
            }
        }

        false
    }

    /// Takes every queued item, in insertion order. Must not be called
    /// while the queue is parked.
    pub(crate) unsafe fn dequeue_all(&self) -> OpQueue {
        let value = self.head.load(Relaxed);
        if value.is_null() {
            return OpQueue::new();
        }

        debug_assert!(value != self.inactive_value());
        let value = self.head.swap(ptr::null_mut(), Acquire);

        debug_assert!(value != self.inactive_value());
        debug_assert!(!value.is_null());

        OpQueue::make_reversed(value)
    }

    /// Takes every queued item as a raw LIFO chain.
    #[allow(dead_code)]
    pub(crate) unsafe fn dequeue_all_reversed(&self) -> OpStack {
        let value = self.head.load(Relaxed);
        if value.is_null() {
            return OpStack::new();
        }

        debug_assert!(value != self.inactive_value());
        let value = self.head.swap(ptr::null_mut(), Acquire);

        debug_assert!(value != self.inactive_value());
        debug_assert!(!value.is_null());

        OpStack::adopt(value)
    }

    /// Parks the queue if it is empty; otherwise drains it. An empty
    /// result means the queue is now parked and producers will signal.
    pub(crate) unsafe fn mark_inactive_or_dequeue_all(&self) -> OpQueue {
        if self.mark_inactive() {
            return OpQueue::new();
        }

        let value = self.head.swap(ptr::null_mut(), Acquire);
        debug_assert!(!value.is_null());
        debug_assert!(value != self.inactive_value());

        OpQueue::make_reversed(value)
    }
}

impl Drop for AtomicOpQueue {
    fn drop(&mut self) {
        let head = self.head.load(Relaxed);
        debug_assert!(head.is_null() || head == self.inactive_value());
    }
}
