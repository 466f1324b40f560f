// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

//! A single-threaded io_uring proactor.
//!
//! An [`IoContext`] owns a submission/completion ring pair and drives
//! every operation submitted against it from one thread, the thread that
//! called [`IoContext::run`]. Operations may be *started* from any
//! thread: off-thread starts hop onto the loop through a lock-free
//! remote queue paired with an eventfd wake-up. Completions are
//! delivered as continuations, invoked on the loop thread with a
//! [`Result`] carrying the operation's outcome.
//!
//! Parallelism comes from running several contexts, each owning its own
//! file descriptors; a single context never migrates across threads
//! while running.

#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

extern crate nix;

use std::cell::{Cell, UnsafeCell};
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use nix::libc;
use nix::sys::eventfd::{EfdFlags, EventFd};

mod clock;
mod intrusive;
mod io;
mod mpsc;
mod op;
mod ring;
mod socket;
mod stop;

pub mod file;
pub mod tcp;
pub mod time;
pub mod udp;

pub use clock::{MonotonicClock, TimePoint};
pub use socket::async_socket;
pub use stop::{StopCallback, StopSource, StopToken};

use intrusive::{OpQueue, TimerQueue};
use mpsc::AtomicOpQueue;
use op::{OpHeader, StopOp, TimerOp, CANCEL_PENDING_FLAG, TIMER_ELAPSED_FLAG};
use ring::{
    io_uring_enter, IoUringSqe, KernelTimespec, Ring, IORING_ENTER_GETEVENTS, IORING_OP_POLL_ADD,
    IORING_OP_TIMEOUT, IORING_OP_TIMEOUT_REMOVE, IORING_TIMEOUT_ABS,
};

pub type Result<T> = std::result::Result<T, nix::Error>;

const REMOTE_QUEUE_EVENT_USER_DATA: u64 = 0;

thread_local! {
    static CURRENT_CONTEXT: Cell<*const ContextInner> = const { Cell::new(ptr::null()) };
}

//-----------------------------------------------------------------------------

/// Loop-thread-only state. Everything in here is mutated exclusively by
/// the thread running the context; cross-thread traffic goes through
/// `ContextInner::remote_queue` and the eventfd.
struct LoopState {
    local_queue: OpQueue,
    pending_io_queue: OpQueue,

    timers: TimerQueue,
    current_duetime: Option<TimePoint>,

    sq_unflushed_count: u32,
    cq_pending_count: u32,

    timers_are_dirty: bool,
    remote_queue_read_submitted: bool,

    active_timer_count: u32,
    time: KernelTimespec,
}

impl LoopState {
    fn new() -> LoopState {
        LoopState {
            local_queue: OpQueue::new(),
            pending_io_queue: OpQueue::new(),
            timers: TimerQueue::new(),
            current_duetime: None,
            sq_unflushed_count: 0,
            cq_pending_count: 0,
            timers_are_dirty: false,
            remote_queue_read_submitted: false,
            active_timer_count: 0,
            time: KernelTimespec::default(),
        }
    }

    // every submitted SQE eventually produces a CQE; keeping this sum
    // under cq_entry_count is what makes CQ overflow impossible
    fn pending_operation_count(&self) -> u32 {
        self.cq_pending_count + self.sq_unflushed_count
    }
}

//-----------------------------------------------------------------------------

pub(crate) struct ContextInner {
    ring: Ring,
    event_fd: EventFd,
    state: UnsafeCell<LoopState>,
    remote_queue: AtomicOpQueue,
}

// `state` is only touched from the loop thread; see LoopState.
unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

impl ContextInner {
    fn state(&self) -> *mut LoopState {
        self.state.get()
    }

    pub(crate) fn is_running_on_io_thread(&self) -> bool {
        CURRENT_CONTEXT.with(Cell::get) == ptr::from_ref(self)
    }

    fn timer_user_data(&self) -> u64 {
        unsafe { ptr::addr_of!((*self.state()).timers) as u64 }
    }

    fn remove_timer_user_data(&self) -> u64 {
        unsafe { ptr::addr_of!((*self.state()).current_duetime) as u64 }
    }

    pub(crate) unsafe fn schedule(&self, op: *mut OpHeader) {
        assert!(!op.is_null());

        if self.is_running_on_io_thread() {
            self.schedule_local(op);
        } else {
            self.schedule_remote(op);
        }
    }

    unsafe fn schedule_local(&self, op: *mut OpHeader) {
        (*self.state()).local_queue.push_back(op);
    }

    unsafe fn schedule_local_queue(&self, ops: OpQueue) {
        (*self.state()).local_queue.append(ops);
    }

    pub(crate) unsafe fn schedule_remote(&self, op: *mut OpHeader) {
        let io_thread_was_inactive = self.remote_queue.enqueue(op);
        if io_thread_was_inactive {
            self.signal_remote_queue();
        }
    }

    pub(crate) unsafe fn schedule_pending_io(&self, op: *mut OpHeader) {
        debug_assert!(self.is_running_on_io_thread());
        (*self.state()).pending_io_queue.push_back(op);
    }

    pub(crate) unsafe fn reschedule_pending_io(&self, op: *mut OpHeader) {
        debug_assert!(self.is_running_on_io_thread());
        (*self.state()).pending_io_queue.push_front(op);
    }

    pub(crate) unsafe fn insert_timer(&self, op: *mut TimerOp) {
        debug_assert!(self.is_running_on_io_thread());

        let state = self.state();
        (*state).timers.insert(op);
        (*op).in_heap = true;
        if (*state).timers.top() == op {
            (*state).timers_are_dirty = true;
        }
    }

    pub(crate) unsafe fn remove_timer(&self, op: *mut TimerOp) {
        let state = self.state();
        assert!(!(*state).timers.is_empty());

        if (*state).timers.top() == op {
            (*state).timers_are_dirty = true;
        }
        (*state).timers.remove(op);
        (*op).in_heap = false;
    }

    fn signal_remote_queue(&self) {
        let value = 1_u64.to_ne_bytes();
        let n = unsafe {
            libc::write(
                self.event_fd.as_raw_fd(),
                value.as_ptr().cast::<libc::c_void>(),
                value.len(),
            )
        };
        assert_eq!(n, 8, "eventfd write failed");
    }

    /// Claims the next SQE slot, zeroes it and hands it to `fill`.
    /// Returns false when the ring is full, the completion budget is
    /// exhausted, or `fill` itself declined the slot.
    pub(crate) unsafe fn submit_io<F>(&self, fill: F) -> bool
    where
        F: FnOnce(&mut IoUringSqe) -> bool,
    {
        debug_assert!(self.is_running_on_io_thread());

        let state = self.state();
        if (*state).pending_operation_count() < self.ring.cq_entry_count {
            let head = self.ring.sq_head().load(Acquire);
            let tail = self.ring.sq_tail().load(Relaxed);

            let used_count = tail.wrapping_sub(head);
            assert!(used_count <= self.ring.sq_entry_count);

            if used_count < self.ring.sq_entry_count {
                let sqe = self.ring.sqe_at(tail);
                *sqe = mem::zeroed();

                if !fill(&mut *sqe) {
                    return false;
                }

                self.ring.publish_sq_index(tail);
                self.ring.sq_tail().store(tail.wrapping_add(1), Release);

                (*state).sq_unflushed_count += 1;
                return true;
            }
        }

        false
    }

    unsafe fn can_submit_io(&self) -> bool {
        let state = self.state();
        (*state).sq_unflushed_count < self.ring.sq_entry_count
            && (*state).pending_operation_count() < self.ring.cq_entry_count
    }

    unsafe fn execute_pending_local(&self) {
        let state = self.state();
        if (*state).local_queue.is_empty() {
            return;
        }

        // snapshot: work scheduled by these operations runs next
        // iteration, which bounds the batch
        let mut pending = (*state).local_queue.take();
        while !pending.is_empty() {
            let item = pending.pop_front();
            ((*item).execute)(item);
        }
    }

    unsafe fn acquire_completion_queue_items(&self) {
        let head = self.ring.cq_head().load(Relaxed);
        let tail = self.ring.cq_tail().load(Acquire);

        if head == tail {
            return;
        }

        let count = tail.wrapping_sub(head);
        assert!(count <= self.ring.cq_entry_count);

        let state = self.state();
        let mut completion_queue = OpQueue::new();

        for i in 0..count {
            let cqe = &*self.ring.cqe_at(head.wrapping_add(i));

            if cqe.user_data == REMOTE_QUEUE_EVENT_USER_DATA {
                assert!(cqe.res >= 0, "eventfd poll failed");

                let mut buffer = [0_u8; 8];
                let bytes_read = libc::read(
                    self.event_fd.as_raw_fd(),
                    buffer.as_mut_ptr().cast::<libc::c_void>(),
                    buffer.len(),
                );
                assert_eq!(bytes_read, 8, "eventfd read failed");

                (*state).remote_queue_read_submitted = false;
                continue;
            }

            if cqe.user_data == self.timer_user_data() {
                assert!((*state).active_timer_count > 0);
                (*state).active_timer_count -= 1;

                if cqe.res != -libc::ECANCELED {
                    (*state).timers_are_dirty = true;
                }

                if (*state).active_timer_count == 0 {
                    (*state).current_duetime = None;
                }
                continue;
            }

            if cqe.user_data == self.remove_timer_user_data() {
                continue;
            }

            let completion = cqe.user_data as usize as *mut op::CompletionHeader;
            (*completion).result = cqe.res;
            completion_queue.push_back(completion.cast::<OpHeader>());
        }

        self.schedule_local_queue(completion_queue);

        self.ring.cq_head().store(tail, Release);
        (*state).cq_pending_count -= count;
    }

    unsafe fn acquire_remote_queued_items(&self) {
        debug_assert!(!(*self.state()).remote_queue_read_submitted);

        let items = self.remote_queue.dequeue_all();
        self.schedule_local_queue(items);
    }

    unsafe fn register_remote_queue_notification(&self) -> bool {
        self.submit_io(|sqe| unsafe {
            let queued_items = self.remote_queue.mark_inactive_or_dequeue_all();

            if !queued_items.is_empty() {
                // items slipped in before we could park; run them
                // instead of arming the poll
                self.schedule_local_queue(queued_items);
                return false;
            }

            sqe.opcode = IORING_OP_POLL_ADD;
            sqe.fd = self.event_fd.as_raw_fd();
            sqe.op_flags = libc::POLLIN as u32;
            sqe.user_data = REMOTE_QUEUE_EVENT_USER_DATA;
            true
        })
    }

    unsafe fn submit_timer(&self, duetime: TimePoint) -> bool {
        let state = self.state();

        let submitted = self.submit_io(|sqe| unsafe {
            (*state).time = KernelTimespec {
                tv_sec: duetime.seconds_part(),
                tv_nsec: duetime.nanoseconds_part(),
            };

            sqe.opcode = IORING_OP_TIMEOUT;
            sqe.addr = ptr::addr_of!((*state).time) as u64;
            sqe.len = 1;
            sqe.op_flags = IORING_TIMEOUT_ABS;
            sqe.user_data = self.timer_user_data();
            true
        });

        if submitted {
            (*state).active_timer_count += 1;
        }
        submitted
    }

    unsafe fn submit_timer_cancel(&self) -> bool {
        self.submit_io(|sqe| {
            sqe.opcode = IORING_OP_TIMEOUT_REMOVE;
            sqe.addr = self.timer_user_data();
            sqe.user_data = self.remove_timer_user_data();
            true
        })
    }

    /// Reconciles the single armed kernel timeout with the head of the
    /// timer list; only runs when `timers_are_dirty`.
    unsafe fn update_timers(&self) {
        let state = self.state();

        if !(*state).timers.is_empty() {
            let now = MonotonicClock::now();

            while !(*state).timers.is_empty() && (*(*state).timers.top()).duetime <= now {
                let item = (*state).timers.pop();
                (*item).in_heap = false;

                if (*item).cancelable {
                    let old_state = (*item).state.fetch_or(TIMER_ELAPSED_FLAG, AcqRel);

                    if old_state & CANCEL_PENDING_FLAG != 0 {
                        // a remote canceller owns delivery now
                        continue;
                    }
                }

                self.schedule_local(item.cast::<OpHeader>());
            }
        }

        if (*state).timers.is_empty() {
            if (*state).current_duetime.is_some() {
                if self.submit_timer_cancel() {
                    (*state).current_duetime = None;
                    (*state).timers_are_dirty = false;
                }
            } else {
                (*state).timers_are_dirty = false;
            }
            return;
        }

        let earliest_duetime = (*(*state).timers.top()).duetime;

        match (*state).current_duetime {
            Some(current_duetime) => {
                // a stale arming that is at most 1us early is left in
                // place; its completion will re-dirty the timers
                let threshold = Duration::from_micros(1);

                if earliest_duetime < current_duetime - threshold {
                    if self.submit_timer_cancel() {
                        (*state).current_duetime = None;

                        if self.submit_timer(earliest_duetime) {
                            (*state).current_duetime = Some(earliest_duetime);
                            (*state).timers_are_dirty = false;
                        }
                    }
                } else {
                    (*state).timers_are_dirty = false;
                }
            }
            None => {
                if self.submit_timer(earliest_duetime) {
                    (*state).current_duetime = Some(earliest_duetime);
                    (*state).timers_are_dirty = false;
                }
            }
        }
    }

    fn run_impl(&self, stop_op: &StopOp) -> Result<()> {
        let _guard = RunGuard::enter(self);

        loop {
            unsafe { self.execute_pending_local() };

            if stop_op.should_stop() {
                break;
            }

            unsafe {
                self.acquire_completion_queue_items();

                let state = self.state();

                if (*state).timers_are_dirty {
                    self.update_timers();
                }

                if !(*state).remote_queue_read_submitted {
                    self.acquire_remote_queued_items();
                }

                while !(*state).pending_io_queue.is_empty() && self.can_submit_io() {
                    let item = (*state).pending_io_queue.pop_front();
                    ((*item).execute)(item);
                }

                if (*state).local_queue.is_empty() || (*state).sq_unflushed_count > 0 {
                    let is_idle =
                        (*state).sq_unflushed_count == 0 && (*state).local_queue.is_empty();

                    if is_idle && !(*state).remote_queue_read_submitted {
                        (*state).remote_queue_read_submitted =
                            self.register_remote_queue_notification();
                    }

                    let mut flags = 0;
                    let mut min_completion_count = 0;

                    if is_idle
                        && ((*state).remote_queue_read_submitted
                            || (*state).pending_operation_count() == self.ring.cq_entry_count)
                    {
                        min_completion_count = 1;
                        flags = IORING_ENTER_GETEVENTS;
                    }

                    let result = match io_uring_enter(
                        self.ring.fd(),
                        (*state).sq_unflushed_count,
                        min_completion_count,
                        flags,
                    ) {
                        Ok(n) => n as u32,
                        Err(err) => {
                            warn!("io_uring_enter failed: {err}");
                            return Err(err);
                        }
                    };

                    (*state).sq_unflushed_count -= result;
                    (*state).cq_pending_count += result;
                }
            }
        }

        Ok(())
    }
}

//-----------------------------------------------------------------------------

struct RunGuard {
    old_context: *const ContextInner,
}

impl RunGuard {
    fn enter(context: &ContextInner) -> RunGuard {
        let old_context = CURRENT_CONTEXT.with(|current| current.replace(ptr::from_ref(context)));
        RunGuard { old_context }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let old_context = self.old_context;
        CURRENT_CONTEXT.with(|current| current.set(old_context));
    }
}

//-----------------------------------------------------------------------------

pub struct IoContextParams {
    pub sq_entries: u32,
}

impl IoContextParams {
    #[must_use]
    pub fn new() -> Self {
        Self { sq_entries: 256 }
    }
}

impl Default for IoContextParams {
    fn default() -> Self {
        Self::new()
    }
}

//-----------------------------------------------------------------------------

pub struct IoContext {
    inner: Arc<ContextInner>,
}

impl IoContext {
    pub fn new() -> Result<IoContext> {
        Self::with_params(&IoContextParams::new())
    }

    pub fn with_params(params: &IoContextParams) -> Result<IoContext> {
        let ring = Ring::new(params.sq_entries)?;
        let event_fd =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;

        Ok(IoContext {
            inner: Arc::new(ContextInner {
                ring,
                event_fd,
                state: UnsafeCell::new(LoopState::new()),
                remote_queue: AtomicOpQueue::new(),
            }),
        })
    }

    #[must_use]
    pub fn get_executor(&self) -> Executor {
        Executor {
            inner: self.inner.clone(),
        }
    }

    /// Runs the loop on the calling thread until `token` signals stop.
    ///
    /// The stop callback schedules a sentinel operation onto the loop,
    /// so a stop requested from any thread wakes an idle loop and is
    /// observed before the next blocking submit.
    pub fn run(&mut self, token: StopToken) -> Result<()> {
        let stop_op = StopOp::new();

        #[derive(Clone, Copy)]
        struct SendOpPtr(*mut OpHeader);
        unsafe impl Send for SendOpPtr {}

        let op = SendOpPtr(stop_op.as_op());
        let ex = self.get_executor();

        let _stop_callback = StopCallback::new(&token, move || {
            let op = op;
            unsafe { ex.inner.schedule(op.0) };
        });

        self.inner.run_impl(&stop_op)
    }
}

//-----------------------------------------------------------------------------

/// Cheap handle onto a context, used to start operations against it
/// from any thread.
#[derive(Clone)]
pub struct Executor {
    pub(crate) inner: Arc<ContextInner>,
}

#[repr(C)]
struct PostOp<F> {
    base: OpHeader,
    receiver: Option<F>,
}

impl<F: FnOnce() + Send + 'static> PostOp<F> {
    unsafe fn execute_impl(op: *mut OpHeader) {
        let mut this = Box::from_raw(op.cast::<PostOp<F>>());
        let receiver = this.receiver.take().unwrap();
        drop(this);

        receiver();
    }
}

impl Executor {
    /// Runs `f` on the loop thread exactly once. No SQE is consumed;
    /// the callable is carried through the scheduling queues alone.
    pub fn post<F: FnOnce() + Send + 'static>(&self, f: F) {
        let op = Box::into_raw(Box::new(PostOp {
            base: OpHeader::new(PostOp::<F>::execute_impl),
            receiver: Some(f),
        }));

        unsafe { self.inner.schedule(op.cast::<OpHeader>()) };
    }
}
