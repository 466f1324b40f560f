// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

//! Link-field queues over operation headers. Pushing never allocates; the
//! queues borrow the `next` (and for timers, `heap_prev`/`heap_next`)
//! fields of the operations themselves, so an operation must be in at
//! most one queue at a time.

use std::mem;
use std::ptr;

use crate::op::{OpHeader, TimerOp};

/// Singly linked FIFO of operations.
pub(crate) struct OpQueue {
    head: *mut OpHeader,
    tail: *mut OpHeader,
}

impl OpQueue {
    pub(crate) fn new() -> OpQueue {
        OpQueue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// Reverses a LIFO chain (such as the one the remote queue hands
    /// back) into FIFO order.
    pub(crate) unsafe fn make_reversed(mut list: *mut OpHeader) -> OpQueue {
        let mut new_head = ptr::null_mut::<OpHeader>();
        let new_tail = list;

        while !list.is_null() {
            let next = (*list).next;
            (*list).next = new_head;
            new_head = list;
            list = next;
        }

        OpQueue {
            head: new_head,
            tail: new_tail,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) unsafe fn pop_front(&mut self) -> *mut OpHeader {
        assert!(!self.is_empty());

        let item = self.head;
        self.head = (*item).next;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        item
    }

    pub(crate) unsafe fn push_front(&mut self, item: *mut OpHeader) {
        assert!(!item.is_null());

        (*item).next = self.head;
        self.head = item;
        if self.tail.is_null() {
            self.tail = item;
        }
    }

    pub(crate) unsafe fn push_back(&mut self, item: *mut OpHeader) {
        assert!(!item.is_null());
        (*item).next = ptr::null_mut();

        if self.tail.is_null() {
            self.head = item;
        } else {
            (*self.tail).next = item;
        }
        self.tail = item;
    }

    pub(crate) unsafe fn append(&mut self, mut other: OpQueue) {
        if other.is_empty() {
            return;
        }

        let other_head = mem::replace(&mut other.head, ptr::null_mut());
        if self.is_empty() {
            self.head = other_head;
        } else {
            (*self.tail).next = other_head;
        }
        self.tail = mem::replace(&mut other.tail, ptr::null_mut());
    }

    pub(crate) fn take(&mut self) -> OpQueue {
        mem::replace(self, OpQueue::new())
    }
}

impl Drop for OpQueue {
    fn drop(&mut self) {
        debug_assert!(self.is_empty());
    }
}

/// Singly linked LIFO. The remote queue's `dequeue_all_reversed` adopts
/// its raw chain as one of these.
pub(crate) struct OpStack {
    head: *mut OpHeader,
}

impl OpStack {
    pub(crate) fn new() -> OpStack {
        OpStack {
            head: ptr::null_mut(),
        }
    }

    pub(crate) fn adopt(head: *mut OpHeader) -> OpStack {
        OpStack { head }
    }

    #[allow(dead_code)]
    pub(crate) fn release(&mut self) -> *mut OpHeader {
        mem::replace(&mut self.head, ptr::null_mut())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[allow(dead_code)]
    pub(crate) unsafe fn push_front(&mut self, item: *mut OpHeader) {
        (*item).next = self.head;
        self.head = item;
    }

    #[allow(dead_code)]
    pub(crate) unsafe fn pop_front(&mut self) -> *mut OpHeader {
        assert!(!self.is_empty());

        let item = self.head;
        self.head = (*item).next;
        item
    }
}

impl Drop for OpStack {
    fn drop(&mut self) {
        debug_assert!(self.is_empty());
    }
}

/// Deadline-ordered doubly linked list of timers. Insertion walks the
/// list; the loop only ever needs the earliest deadline, so `top`, `pop`
/// and `remove` are O(1).
pub(crate) struct TimerQueue {
    head: *mut TimerOp,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            head: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn top(&self) -> *mut TimerOp {
        assert!(!self.is_empty());
        self.head
    }

    pub(crate) unsafe fn pop(&mut self) -> *mut TimerOp {
        assert!(!self.is_empty());

        let item = self.head;
        self.head = (*item).heap_next;
        if !self.head.is_null() {
            (*self.head).heap_prev = ptr::null_mut();
        }
        item
    }

    pub(crate) unsafe fn insert(&mut self, item: *mut TimerOp) {
        if self.head.is_null() {
            self.head = item;
            (*item).heap_next = ptr::null_mut();
            (*item).heap_prev = ptr::null_mut();
        } else if (*item).duetime < (*self.head).duetime {
            (*item).heap_next = self.head;
            (*item).heap_prev = ptr::null_mut();
            (*self.head).heap_prev = item;
            self.head = item;
        } else {
            let mut insert_after = self.head;
            while !(*insert_after).heap_next.is_null()
                && (*(*insert_after).heap_next).duetime <= (*item).duetime
            {
                insert_after = (*insert_after).heap_next;
            }

            let insert_before = (*insert_after).heap_next;
            (*item).heap_prev = insert_after;
            (*item).heap_next = insert_before;
            (*insert_after).heap_next = item;
            if !insert_before.is_null() {
                (*insert_before).heap_prev = item;
            }
        }
    }

    pub(crate) unsafe fn remove(&mut self, item: *mut TimerOp) {
        let prev = (*item).heap_prev;
        let next = (*item).heap_next;

        if !prev.is_null() {
            (*prev).heap_next = next;
        } else {
            assert!(self.head == item);
            self.head = next;
        }

        if !next.is_null() {
            (*next).heap_prev = prev;
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        debug_assert!(self.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimePoint;

    unsafe fn never_execute(_op: *mut OpHeader) {
        unreachable!();
    }

    fn make_ops(n: usize) -> Vec<Box<OpHeader>> {
        (0..n)
            .map(|_| Box::new(OpHeader::new(never_execute)))
            .collect()
    }

    #[test]
    fn queue_is_fifo() {
        let mut ops = make_ops(4);
        let mut q = OpQueue::new();

        unsafe {
            for op in &mut ops {
                q.push_back(std::ptr::from_mut(&mut **op));
            }

            for op in &ops {
                assert_eq!(q.pop_front(), std::ptr::from_ref(&**op).cast_mut());
            }
        }

        assert!(q.is_empty());
    }

    #[test]
    fn push_front_then_pop() {
        let mut ops = make_ops(3);
        let mut q = OpQueue::new();

        unsafe {
            q.push_back(std::ptr::from_mut(&mut *ops[1]));
            q.push_back(std::ptr::from_mut(&mut *ops[2]));
            q.push_front(std::ptr::from_mut(&mut *ops[0]));

            for op in &ops {
                assert_eq!(q.pop_front(), std::ptr::from_ref(&**op).cast_mut());
            }
        }
    }

    #[test]
    fn make_reversed_restores_insertion_order() {
        let mut ops = make_ops(5);

        // build a LIFO chain the way the remote queue does
        let mut stack = OpStack::new();
        unsafe {
            for op in &mut ops {
                stack.push_front(std::ptr::from_mut(&mut **op));
            }

            let mut q = OpQueue::make_reversed(stack.release());
            for op in &ops {
                assert_eq!(q.pop_front(), std::ptr::from_ref(&**op).cast_mut());
            }
            assert!(q.is_empty());
        }
    }

    #[test]
    fn append_preserves_order() {
        let mut ops = make_ops(4);
        let mut a = OpQueue::new();
        let mut b = OpQueue::new();

        unsafe {
            a.push_back(std::ptr::from_mut(&mut *ops[0]));
            a.push_back(std::ptr::from_mut(&mut *ops[1]));
            b.push_back(std::ptr::from_mut(&mut *ops[2]));
            b.push_back(std::ptr::from_mut(&mut *ops[3]));

            a.append(b);

            for op in &ops {
                assert_eq!(a.pop_front(), std::ptr::from_ref(&**op).cast_mut());
            }
        }
    }

    unsafe fn never_execute_timer(_op: *mut OpHeader) {
        unreachable!();
    }

    fn make_timer(secs: i64) -> Box<TimerOp> {
        Box::new(TimerOp::new(
            TimePoint::from_seconds_and_nanoseconds(secs, 0),
            true,
            never_execute_timer,
        ))
    }

    #[test]
    fn timer_queue_orders_by_deadline() {
        let mut t3 = make_timer(3);
        let mut t1 = make_timer(1);
        let mut t2 = make_timer(2);

        let mut q = TimerQueue::new();
        unsafe {
            q.insert(std::ptr::from_mut(&mut *t3));
            q.insert(std::ptr::from_mut(&mut *t1));
            q.insert(std::ptr::from_mut(&mut *t2));

            assert_eq!(q.pop(), std::ptr::from_mut(&mut *t1));
            assert_eq!(q.pop(), std::ptr::from_mut(&mut *t2));
            assert_eq!(q.pop(), std::ptr::from_mut(&mut *t3));
        }
    }

    #[test]
    fn timer_queue_remove_relinks() {
        let mut t1 = make_timer(1);
        let mut t2 = make_timer(2);
        let mut t3 = make_timer(3);

        let mut q = TimerQueue::new();
        unsafe {
            q.insert(std::ptr::from_mut(&mut *t1));
            q.insert(std::ptr::from_mut(&mut *t2));
            q.insert(std::ptr::from_mut(&mut *t3));

            q.remove(std::ptr::from_mut(&mut *t2));
            assert_eq!(q.top(), std::ptr::from_mut(&mut *t1));

            q.remove(std::ptr::from_mut(&mut *t1));
            assert_eq!(q.pop(), std::ptr::from_mut(&mut *t3));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn timer_queue_equal_deadlines_are_fifo() {
        let mut t1 = make_timer(7);
        let mut t2 = make_timer(7);

        let mut q = TimerQueue::new();
        unsafe {
            q.insert(std::ptr::from_mut(&mut *t1));
            q.insert(std::ptr::from_mut(&mut *t2));

            assert_eq!(q.pop(), std::ptr::from_mut(&mut *t1));
            assert_eq!(q.pop(), std::ptr::from_mut(&mut *t2));
        }
    }
}
