// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

use nix::errno::Errno;
use nix::libc;
use nix::sys::socket::{
    bind, getsockname, listen, setsockopt, shutdown,
    sockopt::{ReuseAddr, ReusePort},
    AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrLike, SockaddrStorage,
};

pub use nix::sys::socket::Shutdown;

use crate::io::{RwOp, IORING_OP_READV, IORING_OP_WRITEV};
use crate::op::{CompletionHeader, OpHeader};
use crate::ring::{IORING_OP_ACCEPT, IORING_OP_CONNECT};
use crate::socket::{self, storage_to_socketaddr};
use crate::{Executor, Result};

//-----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct AcceptorOpts {
    pub reuse_addr: bool,
    pub reuse_port: bool,
}

impl Default for AcceptorOpts {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            reuse_port: false,
        }
    }
}

//-----------------------------------------------------------------------------

/// A listening TCP socket accepting connections through the ring.
pub struct Acceptor {
    ex: Executor,
    fd: OwnedFd,
    addr: SockaddrStorage,
}

impl Acceptor {
    const DEFAULT_BACKLOG: i32 = 1024;

    pub fn bind(ex: Executor, addr: SocketAddr) -> Result<Acceptor> {
        Self::bind_with_opts(ex, addr, &AcceptorOpts::default())
    }

    pub fn bind_with_opts(ex: Executor, addr: SocketAddr, opts: &AcceptorOpts) -> Result<Acceptor> {
        let af = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };

        let socket = nix::sys::socket::socket(
            af,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::Tcp,
        )?;

        if opts.reuse_addr {
            setsockopt(&socket, ReuseAddr, &true)?;
        }

        if opts.reuse_port {
            setsockopt(&socket, ReusePort, &true)?;
        }

        let sockaddr = SockaddrStorage::from(addr);
        bind(socket.as_raw_fd(), &sockaddr)?;
        listen(&socket, Backlog::new(Self::DEFAULT_BACKLOG).unwrap())?;

        // recovers the concrete port when binding to the wildcard port
        let addr = getsockname::<SockaddrStorage>(socket.as_raw_fd())?;

        Ok(Acceptor {
            ex,
            fd: socket,
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

    /// Accepts one connection; the continuation receives the connected
    /// stream.
    pub fn async_accept<F>(&self, f: F)
    where
        F: FnOnce(Result<Stream>) + Send + 'static,
    {
        AcceptOp::start_new(self.ex.clone(), self.fd.as_raw_fd(), f);
    }
}

//-----------------------------------------------------------------------------

#[repr(C)]
struct AcceptOp<F> {
    comp: CompletionHeader,
    ex: Executor,
    fd: RawFd,
    receiver: Option<F>,
}

impl<F> AcceptOp<F>
where
    F: FnOnce(Result<Stream>) + Send + 'static,
{
    fn start_new(ex: Executor, fd: RawFd, receiver: F) {
        let op = Box::into_raw(Box::new(AcceptOp {
            comp: CompletionHeader::new(Self::on_schedule_complete),
            ex,
            fd,
            receiver: Some(receiver),
        }));

        unsafe { Self::start(op) };
    }

    unsafe fn start(op: *mut AcceptOp<F>) {
        let ex = (*op).ex.clone();

        if ex.inner.is_running_on_io_thread() {
            Self::start_io(op);
        } else {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_remote(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_schedule_complete(op: *mut OpHeader) {
        Self::start_io(op.cast::<AcceptOp<F>>());
    }

    unsafe fn start_io(op: *mut AcceptOp<F>) {
        let ex = (*op).ex.clone();
        debug_assert!(ex.inner.is_running_on_io_thread());

        let submitted = ex.inner.submit_io(|sqe| unsafe {
            sqe.opcode = IORING_OP_ACCEPT;
            sqe.fd = (*op).fd;
            sqe.op_flags = libc::SOCK_NONBLOCK as u32;
            sqe.user_data = ptr::addr_of_mut!((*op).comp) as u64;

            (*op).comp.base.execute = Self::on_accept;
            true
        });

        if !submitted {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_pending_io(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_accept(header: *mut OpHeader) {
        let mut this = Box::from_raw(header.cast::<AcceptOp<F>>());
        let receiver = this.receiver.take().unwrap();
        let ex = this.ex.clone();
        let result = this.comp.result;
        drop(this);

        if result >= 0 {
            let fd = OwnedFd::from_raw_fd(result);
            receiver(Ok(Stream::from_parts(ex, fd)));
        } else {
            receiver(Err(Errno::from_raw(-result)));
        }
    }
}

//-----------------------------------------------------------------------------

#[repr(C)]
struct ConnectOp<F> {
    comp: CompletionHeader,
    ex: Executor,
    fd: Option<OwnedFd>,
    addr: SockaddrStorage,
    receiver: Option<F>,
}

impl<F> ConnectOp<F>
where
    F: FnOnce(Result<Stream>) + Send + 'static,
{
    fn start_new(ex: Executor, fd: OwnedFd, addr: SocketAddr, receiver: F) {
        let op = Box::into_raw(Box::new(ConnectOp {
            comp: CompletionHeader::new(Self::on_schedule_complete),
            ex,
            fd: Some(fd),
            addr: socket::socketaddr_to_storage(addr),
            receiver: Some(receiver),
        }));

        unsafe { Self::start(op) };
    }

    unsafe fn start(op: *mut ConnectOp<F>) {
        let ex = (*op).ex.clone();

        if ex.inner.is_running_on_io_thread() {
            Self::start_io(op);
        } else {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_remote(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_schedule_complete(op: *mut OpHeader) {
        Self::start_io(op.cast::<ConnectOp<F>>());
    }

    unsafe fn start_io(op: *mut ConnectOp<F>) {
        let ex = (*op).ex.clone();
        debug_assert!(ex.inner.is_running_on_io_thread());

        let submitted = ex.inner.submit_io(|sqe| unsafe {
            sqe.opcode = IORING_OP_CONNECT;
            sqe.fd = (*op).fd.as_ref().unwrap().as_raw_fd();
            sqe.addr = (*op).addr.as_ptr() as u64;
            sqe.off = u64::from(socket::storage_len(&(*op).addr));
            sqe.user_data = ptr::addr_of_mut!((*op).comp) as u64;

            (*op).comp.base.execute = Self::on_connect;
            true
        });

        if !submitted {
            (*op).comp.base.execute = Self::on_schedule_complete;
            ex.inner.schedule_pending_io(op.cast::<OpHeader>());
        }
    }

    unsafe fn on_connect(header: *mut OpHeader) {
        let mut this = Box::from_raw(header.cast::<ConnectOp<F>>());
        let receiver = this.receiver.take().unwrap();
        let ex = this.ex.clone();
        let fd = this.fd.take().unwrap();
        let result = this.comp.result;
        drop(this);

        if result >= 0 {
            receiver(Ok(Stream::from_parts(ex, fd)));
        } else {
            receiver(Err(Errno::from_raw(-result)));
        }
    }
}

/// Connects to `addr`: creates the socket through the ring's `SOCKET`
/// operation, applies `SO_REUSEPORT` and `SO_REUSEADDR`, then issues
/// `CONNECT`. The continuation receives the connected stream.
pub fn async_connect<F>(ex: &Executor, addr: SocketAddr, f: F)
where
    F: FnOnce(Result<Stream>) + Send + 'static,
{
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let ex2 = ex.clone();
    socket::async_socket(
        ex,
        domain,
        libc::SOCK_STREAM,
        libc::IPPROTO_TCP,
        move |result| match result {
            Ok(fd) => {
                if let Err(err) = socket::set_reuse(&fd) {
                    f(Err(err));
                    return;
                }
                ConnectOp::start_new(ex2, fd, addr, f);
            }
            Err(err) => f(Err(err)),
        },
    );
}

//-----------------------------------------------------------------------------

/// A connected TCP stream. Handles are cheap to clone and share the
/// underlying descriptor; the descriptor closes when the last handle
/// drops.
#[derive(Clone)]
pub struct Stream {
    ex: Executor,
    fd: Arc<OwnedFd>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("fd", &self.fd).finish()
    }
}

impl Stream {
    pub(crate) fn from_parts(ex: Executor, fd: OwnedFd) -> Stream {
        Stream {
            ex,
            fd: Arc::new(fd),
        }
    }

    #[must_use]
    pub fn get_executor(&self) -> Executor {
        self.ex.clone()
    }

    /// Reads until `buf` is full. Delivers `ENOMSG` if the peer closed
    /// before any bytes arrived.
    pub fn async_read<F>(&self, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        RwOp::start_new(
            self.ex.clone(),
            self.fd.as_raw_fd(),
            IORING_OP_READV,
            true,
            false,
            0,
            buf,
            f,
        );
    }

    /// Writes all of `buf`.
    pub fn async_write<F>(&self, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        RwOp::start_new(
            self.ex.clone(),
            self.fd.as_raw_fd(),
            IORING_OP_WRITEV,
            true,
            false,
            0,
            buf,
            f,
        );
    }

    /// Reads whatever is available, up to `buf.len()` bytes.
    pub fn async_read_some<F>(&self, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        RwOp::start_new(
            self.ex.clone(),
            self.fd.as_raw_fd(),
            IORING_OP_READV,
            false,
            false,
            0,
            buf,
            f,
        );
    }

    /// Writes some prefix of `buf`.
    pub fn async_write_some<F>(&self, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        RwOp::start_new(
            self.ex.clone(),
            self.fd.as_raw_fd(),
            IORING_OP_WRITEV,
            false,
            false,
            0,
            buf,
            f,
        );
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        shutdown(self.fd.as_raw_fd(), how)
    }
}
