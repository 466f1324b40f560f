// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

use nix::errno::Errno;
use nix::libc;
use nix::sys::socket::{
    bind, getsockname, AddressFamily, SockFlag, SockProtocol, SockType, SockaddrLike,
    SockaddrStorage,
};

use crate::op::{CompletionHeader, OpHeader};
use crate::ring::{IORING_OP_RECVMSG, IORING_OP_SENDMSG};
use crate::socket::{self, storage_to_socketaddr};
use crate::{Executor, Result};

//-----------------------------------------------------------------------------

/// A datagram exchange through `RECVMSG`/`SENDMSG`. The `msghdr` wraps
/// the peer sockaddr: outbound it names the destination, inbound the
/// kernel fills it with the sender.
#[repr(C)]
struct DgramOp<F> {
    comp: CompletionHeader,
    ex: Executor,
    fd: RawFd,
    opcode: u8,
    buf: Vec<u8>,
    iov: libc::iovec,
    msg: libc::msghdr,
    addr: SockaddrStorage,
    receiver: Option<F>,
}

impl<F> DgramOp<F>
where
    F: FnOnce(Result<usize>, Vec<u8>, SockaddrStorage) + Send + 'static,
{
    fn start_new(
        ex: Executor,
        fd: RawFd,
        opcode: u8,
        addr: SockaddrStorage,
        buf: Vec<u8>,
        receiver: F,
    ) {
        let op = Box::into_raw(Box::new(DgramOp {
            comp: CompletionHeader::new(Self::on_schedule_complete),
            ex,
            fd,
            opcode,
            buf,
            iov: libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            },
            msg: unsafe { mem::zeroed() },
            addr,
            receiver: Some(receiver),
        }));

        unsafe { Self::start(op) };
    }

    unsafe fn start(op: *mut DgramOp<F>) {
        let ex = (*op).ex.clone();

        if ex.inner.is_running_on_io_thread() {
            Self::start_io(op);
        } else {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_remote(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_schedule_complete(op: *mut OpHeader) {
        Self::start_io(op.cast::<DgramOp<F>>());
    }

    unsafe fn start_io(op: *mut DgramOp<F>) {
        let ex = (*op).ex.clone();
        debug_assert!(ex.inner.is_running_on_io_thread());

        let submitted = ex.inner.submit_io(|sqe| unsafe {
            (*op).iov.iov_base = (*op).buf.as_mut_ptr().cast::<libc::c_void>();
            (*op).iov.iov_len = (*op).buf.len();

            (*op).msg = mem::zeroed();
            (*op).msg.msg_name = (*op).addr.as_ptr().cast_mut().cast::<libc::c_void>();
            (*op).msg.msg_namelen = if (*op).opcode == IORING_OP_RECVMSG {
                mem::size_of::<SockaddrStorage>() as libc::socklen_t
            } else {
                socket::storage_len(&(*op).addr)
            };
            (*op).msg.msg_iov = ptr::addr_of_mut!((*op).iov);
            (*op).msg.msg_iovlen = 1;

            sqe.opcode = (*op).opcode;
            sqe.fd = (*op).fd;
            sqe.addr = ptr::addr_of!((*op).msg) as u64;
            sqe.op_flags = 0;
            sqe.user_data = ptr::addr_of_mut!((*op).comp) as u64;

            (*op).comp.base.execute = Self::on_io_complete;
            true
        });

        if !submitted {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_pending_io(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_io_complete(header: *mut OpHeader) {
        let mut this = Box::from_raw(header.cast::<DgramOp<F>>());
        let receiver = this.receiver.take().unwrap();
        let buf = mem::take(&mut this.buf);
        let addr = this.addr;
        let result = this.comp.result;
        drop(this);

        if result > 0 {
            receiver(Ok(result as usize), buf, addr);
        } else if result == 0 {
            receiver(Err(Errno::ENOMSG), buf, addr);
        } else {
            receiver(Err(Errno::from_raw(-result)), buf, addr);
        }
    }
}

//-----------------------------------------------------------------------------

/// A bound UDP socket.
#[derive(Clone)]
pub struct DatagramSocket {
    ex: Executor,
    fd: Arc<OwnedFd>,
    addr: SockaddrStorage,
}

impl DatagramSocket {
    pub fn bind(ex: Executor, addr: SocketAddr) -> Result<DatagramSocket> {
        let af = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };

        let socket = nix::sys::socket::socket(
            af,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::Udp,
        )?;

        socket::set_reuse(&socket)?;

        let sockaddr = SockaddrStorage::from(addr);
        bind(socket.as_raw_fd(), &sockaddr)?;

        let addr = getsockname::<SockaddrStorage>(socket.as_raw_fd())?;

        Ok(DatagramSocket {
            ex,
            fd: Arc::new(socket),
            addr,
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        if let Some(addr) = self.addr.as_sockaddr_in() {
            return addr.port();
        }

        if let Some(addr) = self.addr.as_sockaddr_in6() {
            return addr.port();
        }

        unreachable!();
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        storage_to_socketaddr(&self.addr)
    }

    #[must_use]
    pub fn get_executor(&self) -> Executor {
        self.ex.clone()
    }

    /// Receives one datagram; the continuation gets the byte count and
    /// the sender's address along with the buffer.
    pub fn async_receive_from<F>(&self, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<(usize, SocketAddr)>, Vec<u8>) + Send + 'static,
    {
        let addr = unsafe { mem::zeroed::<SockaddrStorage>() };

        DgramOp::start_new(
            self.ex.clone(),
            self.fd.as_raw_fd(),
            IORING_OP_RECVMSG,
            addr,
            buf,
            move |result, buf, addr| match result {
                Ok(len) => match storage_to_socketaddr(&addr) {
                    Ok(sender) => f(Ok((len, sender)), buf),
                    Err(err) => f(Err(err), buf),
                },
                Err(err) => f(Err(err), buf),
            },
        );
    }

    /// Sends `buf` as one datagram to `addr`.
    pub fn async_send_to<F>(&self, buf: Vec<u8>, addr: SocketAddr, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        DgramOp::start_new(
            self.ex.clone(),
            self.fd.as_raw_fd(),
            IORING_OP_SENDMSG,
            socket::socketaddr_to_storage(addr),
            buf,
            move |result, buf, _addr| f(result, buf),
        );
    }
}
