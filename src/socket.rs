// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsFd, FromRawFd, OwnedFd};

use nix::libc::c_int;
use nix::errno::Errno;
use nix::sys::socket::{
    setsockopt,
    sockopt::{ReuseAddr, ReusePort},
    SockaddrLike, SockaddrStorage,
};

use crate::op::{CompletionHeader, OpHeader};
use crate::ring::IORING_OP_SOCKET;
use crate::{Executor, Result};

/// The `SOCKET` opcode operation: asks the kernel for a new socket and
/// delivers it as an owned descriptor.
#[repr(C)]
struct SocketOp<F> {
    comp: CompletionHeader,
    ex: Executor,
    domain: c_int,
    ty: c_int,
    protocol: c_int,
    receiver: Option<F>,
}

impl<F> SocketOp<F>
where
    F: FnOnce(Result<OwnedFd>) + Send + 'static,
{
    fn start_new(ex: Executor, domain: c_int, ty: c_int, protocol: c_int, receiver: F) {
        let op = Box::into_raw(Box::new(SocketOp {
            comp: CompletionHeader::new(Self::on_schedule_complete),
            ex,
            domain,
            ty,
            protocol,
            receiver: Some(receiver),
        }));

        unsafe { Self::start(op) };
    }

    unsafe fn start(op: *mut SocketOp<F>) {
        let ex = (*op).ex.clone();

        if ex.inner.is_running_on_io_thread() {
            Self::start_io(op);
        } else {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_remote(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_schedule_complete(op: *mut OpHeader) {
        Self::start_io(op.cast::<SocketOp<F>>());
    }

    unsafe fn start_io(op: *mut SocketOp<F>) {
        let ex = (*op).ex.clone();
        debug_assert!(ex.inner.is_running_on_io_thread());

        let submitted = ex.inner.submit_io(|sqe| unsafe {
            sqe.opcode = IORING_OP_SOCKET;
            sqe.fd = (*op).domain;
            sqe.off = (*op).ty as u64;
            sqe.len = (*op).protocol as u32;
            sqe.op_flags = 0;
            sqe.user_data = std::ptr::addr_of_mut!((*op).comp) as u64;

            (*op).comp.base.execute = Self::on_socket;
            true
        });

        if !submitted {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_pending_io(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_socket(header: *mut OpHeader) {
        let mut this = Box::from_raw(header.cast::<SocketOp<F>>());
        let receiver = this.receiver.take().unwrap();
        let result = this.comp.result;
        drop(this);

        if result >= 0 {
            receiver(Ok(OwnedFd::from_raw_fd(result)));
        } else {
            receiver(Err(Errno::from_raw(-result)));
        }
    }
}

/// Asynchronously creates a socket through the ring.
pub fn async_socket<F>(ex: &Executor, domain: c_int, ty: c_int, protocol: c_int, f: F)
where
    F: FnOnce(Result<OwnedFd>) + Send + 'static,
{
    SocketOp::start_new(ex.clone(), domain, ty, protocol, f);
}

pub(crate) fn set_reuse<F: AsFd>(fd: &F) -> Result<()> {
    setsockopt(fd, ReusePort, &true)?;
    setsockopt(fd, ReuseAddr, &true)?;
    Ok(())
}

pub(crate) fn storage_to_socketaddr(addr: &SockaddrStorage) -> Result<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        return Ok(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())));
    }

    if let Some(sin6) = addr.as_sockaddr_in6() {
        return Ok(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }

    Err(Errno::EAFNOSUPPORT)
}

pub(crate) fn socketaddr_to_storage(addr: SocketAddr) -> SockaddrStorage {
    SockaddrStorage::from(addr)
}

pub(crate) fn storage_len(addr: &SockaddrStorage) -> u32 {
    addr.len()
}
