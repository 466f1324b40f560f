// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

//! Raw `io_uring` plumbing: the kernel ABI structs, the three syscalls
//! and the ring-pair memory mappings. Everything above this module talks
//! to the ring through cached pointers handed out here; the kernel's
//! head/tail acquire/release protocol is the caller's responsibility.

#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use log::debug;
use nix::errno::Errno;
use nix::libc::{self, c_long, c_void};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::Result;

pub(crate) const IORING_OP_READV: u8 = 1;
pub(crate) const IORING_OP_WRITEV: u8 = 2;
pub(crate) const IORING_OP_POLL_ADD: u8 = 6;
pub(crate) const IORING_OP_SENDMSG: u8 = 9;
pub(crate) const IORING_OP_RECVMSG: u8 = 10;
pub(crate) const IORING_OP_TIMEOUT: u8 = 11;
pub(crate) const IORING_OP_TIMEOUT_REMOVE: u8 = 12;
pub(crate) const IORING_OP_ACCEPT: u8 = 13;
pub(crate) const IORING_OP_CONNECT: u8 = 16;
pub(crate) const IORING_OP_SOCKET: u8 = 45;

pub(crate) const IORING_TIMEOUT_ABS: u32 = 1;
pub(crate) const IORING_ENTER_GETEVENTS: u32 = 1;

const IORING_OFF_SQ_RING: i64 = 0;
const IORING_OFF_CQ_RING: i64 = 0x0800_0000;
const IORING_OFF_SQES: i64 = 0x1000_0000;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct SqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct CqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqringOffsets,
    pub cq_off: CqringOffsets,
}

/// One submission-queue slot. The kernel's anonymous unions are
/// flattened; `op_flags` overlays `rw_flags`, `poll_events`,
/// `msg_flags`, `timeout_flags` and `accept_flags`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IoUringSqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub addr3: u64,
    pub __pad2: [u64; 1],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IoUringCqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

fn retry_interruptible<F: FnMut() -> c_long>(mut f: F) -> Result<i32> {
    loop {
        let ret = f();
        if ret < 0 {
            let err = Errno::last();
            if err == Errno::EINTR {
                continue;
            }
            return Err(err);
        }
        return Ok(ret as i32);
    }
}

pub(crate) fn io_uring_setup(entries: u32, params: &mut IoUringParams) -> Result<i32> {
    retry_interruptible(|| unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            c_long::from(entries),
            std::ptr::from_mut(params) as c_long,
        )
    })
}

pub(crate) fn io_uring_enter(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
) -> Result<i32> {
    retry_interruptible(|| unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            c_long::from(fd),
            c_long::from(to_submit),
            c_long::from(min_complete),
            c_long::from(flags),
            std::ptr::null::<libc::sigset_t>() as c_long,
            std::mem::size_of::<libc::sigset_t>() as c_long,
        )
    })
}

pub(crate) fn io_uring_register(
    fd: RawFd,
    opcode: u32,
    arg: *const c_void,
    nr_args: u32,
) -> Result<i32> {
    retry_interruptible(|| unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            c_long::from(fd),
            c_long::from(opcode),
            arg as c_long,
            c_long::from(nr_args),
        )
    })
}

/// A mapped region that is unmapped on every exit path.
pub(crate) struct MmapRegion {
    data: NonNull<c_void>,
    size: usize,
}

unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    fn map<F: AsFd>(fd: F, size: usize, offset: i64) -> Result<MmapRegion> {
        let data = unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_POPULATE,
                fd,
                offset,
            )?
        };

        Ok(MmapRegion { data, size })
    }

    fn data(&self) -> *mut u8 {
        self.data.as_ptr().cast::<u8>()
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.data, self.size) };
    }
}

/// The mapped ring pair plus the SQE array, with the kernel-published
/// geometry cached at setup time.
pub(crate) struct Ring {
    fd: OwnedFd,

    sq_mmap: MmapRegion,
    cq_mmap: MmapRegion,
    sqe_mmap: MmapRegion,

    pub(crate) sq_mask: u32,
    pub(crate) sq_entry_count: u32,
    sq_head: *const AtomicU32,
    sq_tail: *const AtomicU32,
    sq_index_array: *mut u32,
    sq_entries: *mut IoUringSqe,

    pub(crate) cq_mask: u32,
    pub(crate) cq_entry_count: u32,
    cq_head: *const AtomicU32,
    cq_tail: *const AtomicU32,
    cq_entries: *const IoUringCqe,
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub(crate) fn new(sq_entries: u32) -> Result<Ring> {
        let mut params = IoUringParams::default();
        let fd = io_uring_setup(sq_entries, &mut params)?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let cq_size =
            params.cq_off.cqes as usize + params.cq_entries as usize * size_of::<IoUringCqe>();
        let cq_mmap = MmapRegion::map(fd.as_fd(), cq_size, IORING_OFF_CQ_RING)?;
        let cq_block = cq_mmap.data();

        let cq_entry_count = params.cq_entries;
        let cq_mask;
        let cq_head;
        let cq_tail;
        let cq_entries;
        unsafe {
            assert_eq!(
                cq_entry_count,
                *cq_block.add(params.cq_off.ring_entries as usize).cast::<u32>()
            );

            cq_mask = *cq_block.add(params.cq_off.ring_mask as usize).cast::<u32>();
            assert_eq!(cq_mask, cq_entry_count - 1);

            cq_head = cq_block.add(params.cq_off.head as usize).cast::<AtomicU32>() as *const _;
            cq_tail = cq_block.add(params.cq_off.tail as usize).cast::<AtomicU32>() as *const _;
            cq_entries = cq_block.add(params.cq_off.cqes as usize).cast::<IoUringCqe>() as *const _;
        }

        let sq_size = params.sq_off.array as usize + params.sq_entries as usize * size_of::<u32>();
        let sq_mmap = MmapRegion::map(fd.as_fd(), sq_size, IORING_OFF_SQ_RING)?;
        let sq_block = sq_mmap.data();

        let sq_entry_count = params.sq_entries;
        let sq_mask;
        let sq_head;
        let sq_tail;
        let sq_index_array;
        unsafe {
            assert_eq!(
                sq_entry_count,
                *sq_block.add(params.sq_off.ring_entries as usize).cast::<u32>()
            );

            sq_mask = *sq_block.add(params.sq_off.ring_mask as usize).cast::<u32>();
            assert_eq!(sq_mask, sq_entry_count - 1);

            sq_head = sq_block.add(params.sq_off.head as usize).cast::<AtomicU32>() as *const _;
            sq_tail = sq_block.add(params.sq_off.tail as usize).cast::<AtomicU32>() as *const _;
            sq_index_array = sq_block.add(params.sq_off.array as usize).cast::<u32>();
        }

        let sqe_size = params.sq_entries as usize * size_of::<IoUringSqe>();
        let sqe_mmap = MmapRegion::map(fd.as_fd(), sqe_size, IORING_OFF_SQES)?;
        let sq_entries_ptr = sqe_mmap.data().cast::<IoUringSqe>();

        debug!(
            "io_uring ready: {} sq entries, {} cq entries, features {:#x}",
            sq_entry_count, cq_entry_count, params.features
        );

        Ok(Ring {
            fd,
            sq_mmap,
            cq_mmap,
            sqe_mmap,
            sq_mask,
            sq_entry_count,
            sq_head,
            sq_tail,
            sq_index_array,
            sq_entries: sq_entries_ptr,
            cq_mask,
            cq_entry_count,
            cq_head,
            cq_tail,
            cq_entries,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn sq_head(&self) -> &AtomicU32 {
        unsafe { &*self.sq_head }
    }

    pub(crate) fn sq_tail(&self) -> &AtomicU32 {
        unsafe { &*self.sq_tail }
    }

    pub(crate) fn cq_head(&self) -> &AtomicU32 {
        unsafe { &*self.cq_head }
    }

    pub(crate) fn cq_tail(&self) -> &AtomicU32 {
        unsafe { &*self.cq_tail }
    }

    pub(crate) unsafe fn sqe_at(&self, index: u32) -> *mut IoUringSqe {
        self.sq_entries.add((index & self.sq_mask) as usize)
    }

    pub(crate) unsafe fn publish_sq_index(&self, index: u32) {
        *self.sq_index_array.add((index & self.sq_mask) as usize) = index & self.sq_mask;
    }

    pub(crate) unsafe fn cqe_at(&self, index: u32) -> *const IoUringCqe {
        self.cq_entries.add((index & self.cq_mask) as usize)
    }
}
