// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering::Relaxed};
use std::sync::Arc;

use nix::errno::Errno;
use nix::libc;

pub use nix::fcntl::OFlag;
pub use nix::sys::stat::Mode;

use crate::io::{RwOp, IORING_OP_READV, IORING_OP_WRITEV};
use crate::{Executor, Result};

fn open_file(path: &Path, flags: OFlag, mode: Mode) -> Result<OwnedFd> {
    let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;

    let fd = unsafe { libc::open(path.as_ptr(), flags.bits(), libc::c_uint::from(mode.bits())) };
    let fd = Errno::result(fd)?;

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

//-----------------------------------------------------------------------------

/// A file whose reads and writes name their offset explicitly.
#[derive(Clone)]
pub struct RandomAccessFile {
    ex: Executor,
    fd: Arc<OwnedFd>,
}

impl RandomAccessFile {
    pub fn open<P: AsRef<Path>>(
        ex: Executor,
        path: P,
        flags: OFlag,
        mode: Mode,
    ) -> Result<RandomAccessFile> {
        let fd = open_file(path.as_ref(), flags, mode)?;

        Ok(RandomAccessFile {
            ex,
            fd: Arc::new(fd),
        })
    }

    #[must_use]
    pub fn get_executor(&self) -> Executor {
        self.ex.clone()
    }

    /// Reads up to `buf.len()` bytes at `offset`. Delivers `ENOMSG` at
    /// end of file.
    pub fn async_read_some_at<F>(&self, offset: i64, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        RwOp::start_new(
            self.ex.clone(),
            self.fd.as_raw_fd(),
            IORING_OP_READV,
            false,
            false,
            offset,
            buf,
            f,
        );
    }

    /// Writes some prefix of `buf` at `offset`.
    pub fn async_write_some_at<F>(&self, offset: i64, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        RwOp::start_new(
            self.ex.clone(),
            self.fd.as_raw_fd(),
            IORING_OP_WRITEV,
            false,
            false,
            offset,
            buf,
            f,
        );
    }
}

//-----------------------------------------------------------------------------

/// A file carrying its own cursor. Full reads and writes start at the
/// stored offset and advance it by the bytes transferred, so successive
/// operations walk the file sequentially.
#[derive(Clone)]
pub struct StreamFile {
    file: RandomAccessFile,
    offset: Arc<AtomicI64>,
}

impl StreamFile {
    pub fn open<P: AsRef<Path>>(
        ex: Executor,
        path: P,
        flags: OFlag,
        mode: Mode,
    ) -> Result<StreamFile> {
        let file = RandomAccessFile::open(ex, path, flags, mode)?;

        Ok(StreamFile {
            file,
            offset: Arc::new(AtomicI64::new(0)),
        })
    }

    #[must_use]
    pub fn get_executor(&self) -> Executor {
        self.file.get_executor()
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset.load(Relaxed)
    }

    /// Reads until `buf` is full, starting at the stored offset.
    /// Delivers `ENOMSG` at end of file.
    pub fn async_read<F>(&self, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        let offset = self.offset.clone();

        RwOp::start_new(
            self.file.ex.clone(),
            self.file.fd.as_raw_fd(),
            IORING_OP_READV,
            true,
            true,
            offset.load(Relaxed),
            buf,
            move |result, buf| {
                if let Ok(bytes) = result {
                    offset.fetch_add(bytes as i64, Relaxed);
                }
                f(result, buf);
            },
        );
    }

    /// Writes all of `buf` at the stored offset.
    pub fn async_write<F>(&self, buf: Vec<u8>, f: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        let offset = self.offset.clone();

        RwOp::start_new(
            self.file.ex.clone(),
            self.file.fd.as_raw_fd(),
            IORING_OP_WRITEV,
            true,
            true,
            offset.load(Relaxed),
            buf,
            move |result, buf| {
                if let Ok(bytes) = result {
                    offset.fetch_add(bytes as i64, Relaxed);
                }
                f(result, buf);
            },
        );
    }
}
