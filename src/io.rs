// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

//! The vectored read/write operation shared by streams and files.
//!
//! A "full" operation keeps resubmitting until the whole buffer has been
//! transferred; a "some" operation delivers after the first completion.
//! Zero transferred bytes in total means the peer is gone and is
//! reported as `ENOMSG`. Seekable targets advance the submitted offset
//! by each partial completion's byte count; non-seekable targets pass
//! the caller's offset verbatim.

use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use nix::errno::Errno;
use nix::libc;

use crate::op::{CompletionHeader, OpHeader};
use crate::ring::IoUringSqe;
use crate::{Executor, Result};

pub(crate) use crate::ring::{IORING_OP_READV, IORING_OP_WRITEV};

#[repr(C)]
pub(crate) struct RwOp<F> {
    comp: CompletionHeader,
    ex: Executor,
    fd: RawFd,
    opcode: u8,
    full: bool,
    seekable: bool,
    offset: i64,
    buf: Vec<u8>,
    len: usize,
    bytes: usize,
    iov: libc::iovec,
    receiver: Option<F>,
}

impl<F> RwOp<F>
where
    F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
{
    pub(crate) fn start_new(
        ex: Executor,
        fd: RawFd,
        opcode: u8,
        full: bool,
        seekable: bool,
        offset: i64,
        buf: Vec<u8>,
        receiver: F,
    ) {
        let len = buf.len();

        let op = Box::into_raw(Box::new(RwOp {
            comp: CompletionHeader::new(Self::on_schedule_complete),
            ex,
            fd,
            opcode,
            full,
            seekable,
            offset,
            buf,
            len,
            bytes: 0,
            iov: libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            },
            receiver: Some(receiver),
        }));

        unsafe { Self::start(op) };
    }

    unsafe fn start(op: *mut RwOp<F>) {
        let ex = (*op).ex.clone();

        if ex.inner.is_running_on_io_thread() {
            Self::start_io(op);
        } else {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_remote(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_schedule_complete(op: *mut OpHeader) {
        Self::start_io(op.cast::<RwOp<F>>());
    }

    unsafe fn on_resubmit_ready(op: *mut OpHeader) {
        Self::resubmit_io(op.cast::<RwOp<F>>());
    }

    unsafe fn start_io(op: *mut RwOp<F>) {
        let ex = (*op).ex.clone();

        if !Self::try_submit(op) {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_pending_io(op.cast::<OpHeader>());
        }
    }

    /// Continues a partially completed transfer. In-flight operations
    /// replay ahead of fresh submissions when the ring is saturated.
    unsafe fn resubmit_io(op: *mut RwOp<F>) {
        let ex = (*op).ex.clone();

        if !Self::try_submit(op) {
            (*op).comp.base.execute = Self::on_resubmit_ready;
            ex.inner.reschedule_pending_io(op.cast::<OpHeader>());
        }
    }

    unsafe fn try_submit(op: *mut RwOp<F>) -> bool {
        let ex = (*op).ex.clone();
        debug_assert!(ex.inner.is_running_on_io_thread());

        ex.inner.submit_io(|sqe: &mut IoUringSqe| unsafe {
            (*op).iov.iov_base = (*op).buf.as_mut_ptr().add((*op).bytes).cast::<libc::c_void>();
            (*op).iov.iov_len = (*op).len - (*op).bytes;

            sqe.opcode = (*op).opcode;
            sqe.fd = (*op).fd;
            sqe.addr = ptr::addr_of!((*op).iov) as u64;
            sqe.len = 1;
            sqe.off = (*op).offset as u64;
            sqe.user_data = ptr::addr_of_mut!((*op).comp) as u64;

            (*op).comp.base.execute = Self::on_io_complete;
            true
        })
    }

    unsafe fn on_io_complete(header: *mut OpHeader) {
        let op = header.cast::<RwOp<F>>();
        let result = (*op).comp.result;

        if result < 0 {
            Self::complete(op, Err(Errno::from_raw(-result)));
            return;
        }

        (*op).bytes += result as usize;
        if (*op).seekable {
            (*op).offset += i64::from(result);
        }

        let done = !(*op).full || result == 0 || (*op).bytes == (*op).len;

        if done {
            let bytes = (*op).bytes;
            if bytes == 0 {
                Self::complete(op, Err(Errno::ENOMSG));
            } else {
                Self::complete(op, Ok(bytes));
            }
        } else {
            // the previous CQE has been consumed, so the header is
            // quiescent and may back another SQE
            Self::resubmit_io(op);
        }
    }

    unsafe fn complete(op: *mut RwOp<F>, result: Result<usize>) {
        let mut this = Box::from_raw(op);
        let receiver = this.receiver.take().unwrap();
        let buf = mem::take(&mut this.buf);
        drop(this);

        receiver(result, buf);
    }
}
