// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

//! Deadline timers over the loop's in-process timer list and the single
//! armed kernel timeout.
//!
//! A [`Timer`] is a reusable handle; each `async_wait` allocates one
//! shared wait object which lives until its continuation fires. The
//! wait object is jointly owned by the handle (for cancellation) and by
//! the loop (while the wait is in flight); the `TIMER_ELAPSED` /
//! `CANCEL_PENDING` bit pair arbitrates which side delivers.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Relaxed};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;

use crate::clock::{MonotonicClock, TimePoint};
use crate::op::{OpHeader, TimerOp, CANCEL_PENDING_FLAG, TIMER_ELAPSED_FLAG};
use crate::{Executor, Result};

type WaitReceiver = Box<dyn FnOnce(Result<()>) + Send>;

#[repr(C)]
struct TimerWait {
    op: TimerOp,
    ex: Executor,
    receiver: Option<WaitReceiver>,
}

#[repr(transparent)]
struct TimerShared {
    cell: UnsafeCell<TimerWait>,
}

// the wait state is only mutated on the loop thread or before the wait
// has been started; the state word is the exception and is atomic
unsafe impl Send for TimerShared {}
unsafe impl Sync for TimerShared {}

impl TimerShared {
    fn new(ex: Executor, duetime: TimePoint, receiver: WaitReceiver) -> TimerShared {
        TimerShared {
            cell: UnsafeCell::new(TimerWait {
                op: TimerOp::new(duetime, true, TimerWait::on_schedule_complete),
                ex,
                receiver: Some(receiver),
            }),
        }
    }
}

impl TimerWait {
    unsafe fn start(wait: *mut TimerWait) {
        let ex = (*wait).ex.clone();

        if ex.inner.is_running_on_io_thread() {
            Self::start_local(wait);
        } else {
            (*wait).op.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_remote(wait.cast::<OpHeader>());
        }
    }

    unsafe fn start_local(wait: *mut TimerWait) {
        (*wait).op.base.execute = Self::on_timeout;

        let ex = (*wait).ex.clone();
        ex.inner.insert_timer(ptr::addr_of_mut!((*wait).op));
    }

    unsafe fn on_schedule_complete(op: *mut OpHeader) {
        Self::start_local(op.cast::<TimerWait>());
    }

    unsafe fn on_timeout(op: *mut OpHeader) {
        Self::deliver(op.cast::<TimerWait>(), Ok(()));
    }

    unsafe fn on_cancel(op: *mut OpHeader) {
        Self::deliver(op.cast::<TimerWait>(), Err(Errno::ECANCELED));
    }

    /// Invokes the continuation and releases the loop's ownership of
    /// the wait, taken when it was started.
    unsafe fn deliver(wait: *mut TimerWait, result: Result<()>) {
        let receiver = (*wait).receiver.take().unwrap();
        let shared = Arc::from_raw(wait.cast::<TimerShared>().cast_const());

        receiver(result);
        drop(shared);
    }

    unsafe fn request_stop(shared: &Arc<TimerShared>) {
        let wait = shared.cell.get();
        let ex = (*wait).ex.clone();

        if ex.inner.is_running_on_io_thread() {
            Self::request_stop_local(wait, &ex);
        } else {
            Self::request_stop_remote(shared, &ex);
        }
    }

    unsafe fn request_stop_local(wait: *mut TimerWait, ex: &Executor) {
        // if the wait is parked in a scheduling queue, or already queued
        // for elapsed delivery, the overwritten execute turns that
        // delivery into a cancellation
        (*wait).op.base.execute = Self::on_cancel;

        let state = (*wait).op.state.load(Relaxed);
        if state & TIMER_ELAPSED_FLAG == 0 && (*wait).op.in_heap {
            ex.inner.remove_timer(ptr::addr_of_mut!((*wait).op));
            ex.inner.schedule(wait.cast::<OpHeader>());
        }
    }

    unsafe fn request_stop_remote(shared: &Arc<TimerShared>, ex: &Executor) {
        let wait = shared.cell.get();
        let old_state = (*wait).op.state.fetch_or(CANCEL_PENDING_FLAG, AcqRel);

        if old_state & TIMER_ELAPSED_FLAG == 0 {
            // the loop discards the elapse once it observes the cancel
            // bit, so delivery is ours; the removal itself still has to
            // happen on the loop thread
            let shared = shared.clone();

            ex.post(move || unsafe {
                let wait = shared.cell.get();

                let state = (*wait).op.state.load(Relaxed);
                if state & TIMER_ELAPSED_FLAG == 0 {
                    debug_assert!((*wait).op.in_heap);
                    (*wait).ex.inner.remove_timer(ptr::addr_of_mut!((*wait).op));
                }

                Self::deliver(wait, Err(Errno::ECANCELED));
            });
        }
    }
}

//-----------------------------------------------------------------------------

/// A reusable deadline timer.
pub struct Timer {
    ex: Executor,
    duetime: TimePoint,
    wait: Option<Arc<TimerShared>>,
}

impl Timer {
    #[must_use]
    pub fn new(ex: Executor) -> Timer {
        Timer {
            ex,
            duetime: TimePoint::default(),
            wait: None,
        }
    }

    #[must_use]
    pub fn get_executor(&self) -> Executor {
        self.ex.clone()
    }

    #[must_use]
    pub fn now(&self) -> TimePoint {
        MonotonicClock::now()
    }

    pub fn expires_at(&mut self, duetime: TimePoint) {
        self.duetime = duetime;
    }

    pub fn expires_after(&mut self, duration: Duration) {
        self.duetime = MonotonicClock::now() + duration;
    }

    /// Cancels the wait in flight, if any; its continuation is invoked
    /// with `ECANCELED`. A wait whose continuation already ran is
    /// unaffected.
    pub fn cancel(&mut self) {
        if let Some(shared) = self.wait.take() {
            unsafe { TimerWait::request_stop(&shared) };
        }
    }

    /// Waits until the configured deadline, then invokes `f` with
    /// success. Issuing a new wait cancels a previous one that has not
    /// yet fired.
    pub fn async_wait<F>(&mut self, f: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.cancel();

        let shared = Arc::new(TimerShared::new(
            self.ex.clone(),
            self.duetime,
            Box::new(f),
        ));
        self.wait = Some(shared.clone());

        let raw = Arc::into_raw(shared);
        unsafe { TimerWait::start((*raw).cell.get()) };
    }
}
