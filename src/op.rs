// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::Relaxed};

use crate::clock::TimePoint;

/// Dispatch function invoked when an operation is executed by the loop.
///
/// `op` always points at the `OpHeader` embedded at offset zero of the
/// concrete operation, so implementations downcast with a plain pointer
/// cast.
pub(crate) type ExecuteFn = unsafe fn(op: *mut OpHeader);

/// Header embedded at the front of every schedulable operation.
///
/// `next` threads the operation through whichever queue currently owns it
/// (local, pending-IO or remote); an operation is only ever in one queue
/// at a time.
#[repr(C)]
pub(crate) struct OpHeader {
    pub(crate) next: *mut OpHeader,
    pub(crate) execute: ExecuteFn,
}

impl OpHeader {
    pub(crate) fn new(execute: ExecuteFn) -> OpHeader {
        OpHeader {
            next: ptr::null_mut(),
            execute,
        }
    }
}

/// Header for operations that receive a kernel completion. The reaping
/// path stores the raw CQE result here before scheduling the operation
/// locally, which is why `user_data` must round-trip through this type's
/// address.
#[repr(C)]
pub(crate) struct CompletionHeader {
    pub(crate) base: OpHeader,
    pub(crate) result: i32,
}

impl CompletionHeader {
    pub(crate) fn new(execute: ExecuteFn) -> CompletionHeader {
        CompletionHeader {
            base: OpHeader::new(execute),
            result: -1,
        }
    }
}

/// Sentinel operation scheduled by the stop callback; executing it flips
/// the flag `run` checks at the top of every iteration.
#[repr(C)]
pub(crate) struct StopOp {
    base: OpHeader,
    should_stop: AtomicBool,
}

impl StopOp {
    pub(crate) fn new() -> StopOp {
        StopOp {
            base: OpHeader::new(StopOp::execute_impl),
            should_stop: AtomicBool::new(false),
        }
    }

    unsafe fn execute_impl(op: *mut OpHeader) {
        let this = op.cast::<StopOp>();
        (*this).should_stop.store(true, Relaxed);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.should_stop.load(Relaxed)
    }

    pub(crate) fn as_op(&self) -> *mut OpHeader {
        ptr::from_ref(&self.base).cast_mut()
    }
}

pub(crate) const TIMER_ELAPSED_FLAG: u32 = 1;
pub(crate) const CANCEL_PENDING_FLAG: u32 = 2;

/// Header for timer operations. Timers carry a second link pair because a
/// timer moves between the deadline list (doubly linked, `heap_*`) and the
/// local delivery queue (`base.next`) over its lifetime.
///
/// `state` arbitrates the elapse/cancel race: both the loop thread and a
/// remote canceller OR their flag in and inspect the previous value, so
/// exactly one side ends up delivering.
#[repr(C)]
pub(crate) struct TimerOp {
    pub(crate) base: OpHeader,
    pub(crate) duetime: TimePoint,
    pub(crate) cancelable: bool,
    // loop-thread-only: whether the op currently sits in the deadline
    // list, as opposed to a scheduling queue or nowhere at all
    pub(crate) in_heap: bool,
    pub(crate) heap_prev: *mut TimerOp,
    pub(crate) heap_next: *mut TimerOp,
    pub(crate) state: AtomicU32,
}

impl TimerOp {
    pub(crate) fn new(duetime: TimePoint, cancelable: bool, execute: ExecuteFn) -> TimerOp {
        TimerOp {
            base: OpHeader::new(execute),
            duetime,
            cancelable,
            in_heap: false,
            heap_prev: ptr::null_mut(),
            heap_next: ptr::null_mut(),
            state: AtomicU32::new(0),
        }
    }
}
