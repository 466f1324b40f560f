// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

//! Cooperative cancellation. A [`StopSource`] owns a spin-locked,
//! intrusive doubly linked list of callbacks; [`StopToken`]s observe the
//! source and [`StopCallback`]s register against it. Callbacks are
//! delivered exactly once: either by `request_stop`, or synchronously at
//! registration time when stop has already been requested.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicU8,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Bounded spinner used wherever the crate has to wait without entering
/// the kernel. Busy-spins for a fixed number of rounds, then starts
/// yielding the thread.
pub(crate) struct SpinWait {
    count: u32,
}

impl SpinWait {
    const YIELD_THRESHOLD: u32 = 20;

    pub(crate) fn new() -> SpinWait {
        SpinWait { count: 0 }
    }

    pub(crate) fn wait(&mut self) {
        if self.count < Self::YIELD_THRESHOLD {
            self.count += 1;
            std::hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }
}

const STOP_REQUESTED_FLAG: u8 = 1;
const LOCKED_FLAG: u8 = 2;

type CallbackFn = unsafe fn(*mut CallbackNode);

/// List node embedded at offset zero of every registered callback.
///
/// `prev_ptr` points at whatever pointer currently holds this node (the
/// list head or the previous node's `next`), making unlinking O(1).
/// While a delivery is in flight `prev_ptr` is null; `removed_during_callback`
/// and `callback_completed` then arbitrate between the delivering thread
/// and a concurrent deregistration.
#[repr(C)]
struct CallbackNode {
    execute: CallbackFn,
    // frees the node; used by the delivering thread when the callback
    // deregistered itself from inside its own body, in which case the
    // registration object is already gone
    drop_node: CallbackFn,
    next: *mut CallbackNode,
    prev_ptr: *mut *mut CallbackNode,
    removed_during_callback: *mut bool,
    callback_completed: AtomicBool,
}

impl CallbackNode {
    fn new(execute: CallbackFn, drop_node: CallbackFn) -> CallbackNode {
        CallbackNode {
            execute,
            drop_node,
            next: ptr::null_mut(),
            prev_ptr: ptr::null_mut(),
            removed_during_callback: ptr::null_mut(),
            callback_completed: AtomicBool::new(false),
        }
    }
}

#[repr(C)]
struct TypedCallback<F> {
    node: CallbackNode,
    f: F,
}

struct StopState {
    state: AtomicU8,
    callbacks: UnsafeCell<*mut CallbackNode>,
    notifying_thread: UnsafeCell<Option<ThreadId>>,
}

// `callbacks` and `notifying_thread` are only touched while `state`
// holds LOCKED_FLAG.
unsafe impl Send for StopState {}
unsafe impl Sync for StopState {}

impl StopState {
    fn new() -> StopState {
        StopState {
            state: AtomicU8::new(0),
            callbacks: UnsafeCell::new(ptr::null_mut()),
            notifying_thread: UnsafeCell::new(None),
        }
    }

    fn stop_requested(&self) -> bool {
        self.state.load(Acquire) & STOP_REQUESTED_FLAG != 0
    }

    fn lock(&self) -> u8 {
        let mut spin = SpinWait::new();
        let mut old_state = self.state.load(Relaxed);

        loop {
            while old_state & LOCKED_FLAG != 0 {
                spin.wait();
                old_state = self.state.load(Relaxed);
            }

            match self.state.compare_exchange_weak(
                old_state,
                old_state | LOCKED_FLAG,
                Acquire,
                Relaxed,
            ) {
                Ok(_) => return old_state,
                Err(s) => old_state = s,
            }
        }
    }

    fn unlock(&self, old_state: u8) {
        self.state.store(old_state, Release);
    }

    fn lock_unless_stop_requested(&self, set_stop: bool) -> bool {
        let mut spin = SpinWait::new();
        let mut old_state = self.state.load(Relaxed);

        loop {
            loop {
                if old_state & STOP_REQUESTED_FLAG != 0 {
                    return false;
                }
                if old_state == 0 {
                    break;
                }
                spin.wait();
                old_state = self.state.load(Relaxed);
            }

            let new_state = if set_stop {
                LOCKED_FLAG | STOP_REQUESTED_FLAG
            } else {
                LOCKED_FLAG
            };

            match self
                .state
                .compare_exchange_weak(old_state, new_state, AcqRel, Relaxed)
            {
                Ok(_) => return true,
                Err(s) => old_state = s,
            }
        }
    }

    fn request_stop(&self) -> bool {
        if !self.lock_unless_stop_requested(true) {
            return false;
        }

        unsafe {
            *self.notifying_thread.get() = Some(thread::current().id());

            loop {
                let head = self.callbacks.get();
                let callback = *head;
                if callback.is_null() {
                    break;
                }

                (*callback).prev_ptr = ptr::null_mut();
                *head = (*callback).next;
                if !(*head).is_null() {
                    (**head).prev_ptr = head;
                }

                // drop the lock around the callback itself so callbacks
                // may register and deregister others from this thread
                self.state.store(STOP_REQUESTED_FLAG, Release);

                let mut removed_during_callback = false;
                (*callback).removed_during_callback = &mut removed_during_callback;

                ((*callback).execute)(callback);

                if removed_during_callback {
                    // the registration was dropped inside the callback;
                    // the node is ours to free now that the body returned
                    ((*callback).drop_node)(callback);
                } else {
                    (*callback).removed_during_callback = ptr::null_mut();
                    (*callback).callback_completed.store(true, Release);
                }

                self.lock();
            }
        }

        self.state.store(STOP_REQUESTED_FLAG, Release);
        true
    }

    /// Splices a node at the head of the list. Fails (without linking)
    /// when stop has already been requested.
    unsafe fn add_callback(&self, callback: *mut CallbackNode) -> bool {
        if !self.lock_unless_stop_requested(false) {
            return false;
        }

        let head = self.callbacks.get();
        (*callback).next = *head;
        (*callback).prev_ptr = head;
        if !(*head).is_null() {
            (**head).prev_ptr = &mut (*callback).next;
        }
        *head = callback;

        self.unlock(0);
        true
    }

    /// Unlinks a callback. Returns true when the caller retains
    /// ownership of the node; false means the node was surrendered to
    /// the delivery running on this very thread.
    unsafe fn remove_callback(&self, callback: *mut CallbackNode) -> bool {
        let old_state = self.lock();

        if !(*callback).prev_ptr.is_null() {
            *(*callback).prev_ptr = (*callback).next;
            if !(*callback).next.is_null() {
                (*(*callback).next).prev_ptr = (*callback).prev_ptr;
            }
            self.unlock(old_state);
            return true;
        }

        // the node has already been taken off the list by a delivery in
        // progress
        let notifying_thread = *self.notifying_thread.get();
        self.unlock(old_state);

        if Some(thread::current().id()) == notifying_thread {
            // deregistering from inside the callback's own body: the
            // callback frame is still live, so the deliverer frees the
            // node once it returns
            if !(*callback).removed_during_callback.is_null() {
                *(*callback).removed_during_callback = true;
                return false;
            }
            true
        } else {
            let mut spin = SpinWait::new();
            while !(*callback).callback_completed.load(Acquire) {
                spin.wait();
            }
            true
        }
    }
}

impl Drop for StopState {
    fn drop(&mut self) {
        debug_assert!(self.state.load(Relaxed) & LOCKED_FLAG == 0);
        debug_assert!(unsafe { *self.callbacks.get() }.is_null());
    }
}

/// Producer side of a cancellation signal.
pub struct StopSource {
    state: Arc<StopState>,
}

impl StopSource {
    #[must_use]
    pub fn new() -> StopSource {
        StopSource {
            state: Arc::new(StopState::new()),
        }
    }

    #[must_use]
    pub fn get_token(&self) -> StopToken {
        StopToken {
            state: Some(self.state.clone()),
        }
    }

    /// Requests stop and delivers every registered callback on this
    /// thread, one at a time with the lock released around each call.
    /// Returns false if stop had already been requested.
    pub fn request_stop(&self) -> bool {
        self.state.request_stop()
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested()
    }
}

impl Default for StopSource {
    fn default() -> StopSource {
        StopSource::new()
    }
}

/// Observer side of a cancellation signal. Cheap to clone; a token
/// detached from any source reports `stop_possible() == false`.
#[derive(Clone, Default)]
pub struct StopToken {
    state: Option<Arc<StopState>>,
}

impl StopToken {
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        match self.state {
            Some(ref state) => state.stop_requested(),
            None => false,
        }
    }

    #[must_use]
    pub fn stop_possible(&self) -> bool {
        self.state.is_some()
    }
}

/// RAII registration of a callback against a token's source.
///
/// If stop has already been requested, the callback runs synchronously in
/// the registering thread before `new` returns. Dropping the registration
/// deregisters it; a drop racing an in-flight delivery on another thread
/// blocks until that delivery completes, so the callback never runs after
/// the destructor returns.
pub struct StopCallback<F: FnMut() + Send> {
    node: *mut TypedCallback<F>,
    state: Option<Arc<StopState>>,
    _marker: PhantomData<F>,
}

unsafe impl<F: FnMut() + Send> Send for StopCallback<F> {}

impl<F: FnMut() + Send> StopCallback<F> {
    pub fn new(token: &StopToken, f: F) -> StopCallback<F> {
        let node = Box::into_raw(Box::new(TypedCallback {
            node: CallbackNode::new(Self::call, Self::drop_node),
            f,
        }));

        let mut state = token.state.clone();
        if let Some(ref s) = state {
            if !unsafe { s.add_callback(node.cast::<CallbackNode>()) } {
                state = None;
                unsafe { Self::call(node.cast::<CallbackNode>()) };
            }
        }

        StopCallback {
            node,
            state,
            _marker: PhantomData,
        }
    }

    unsafe fn call(p: *mut CallbackNode) {
        let this = p.cast::<TypedCallback<F>>();
        ((*this).f)();
    }

    unsafe fn drop_node(p: *mut CallbackNode) {
        drop(Box::from_raw(p.cast::<TypedCallback<F>>()));
    }
}

impl<F: FnMut() + Send> Drop for StopCallback<F> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            if !unsafe { state.remove_callback(self.node.cast::<CallbackNode>()) } {
                // surrendered to the delivery we are inside of
                return;
            }
        }
        drop(unsafe { Box::from_raw(self.node) });
    }
}
