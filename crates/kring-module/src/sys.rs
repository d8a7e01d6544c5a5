//! Raw io_uring ABI and the two syscalls the rings need.
//!
//! Mirrors `<linux/io_uring.h>` for the subset kring uses. Opcode numbers
//! come from the `io-uring` crate so they track the kernel headers.

use std::os::unix::io::RawFd;

use io_uring::opcode;
use kring_core::entry::{Operation, Submission};
use kring_core::error::{KringError, Result};
use nix::errno::Errno;

// ── mmap offsets ──

pub const IORING_OFF_SQ_RING: i64 = 0;
pub const IORING_OFF_CQ_RING: i64 = 0x0800_0000;
pub const IORING_OFF_SQES: i64 = 0x1000_0000;

// ── setup flags ──

pub const IORING_SETUP_CQSIZE: u32 = 1 << 3;
pub const IORING_SETUP_CLAMP: u32 = 1 << 4;
pub const IORING_SETUP_NO_SQARRAY: u32 = 1 << 16;

// ── feature flags ──

pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;

// ── enter flags ──

pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;

// ── Ring limits ──

pub const SQ_MAX_ENTRIES: u32 = 32_768;
pub const CQ_MAX_ENTRIES: u32 = 65_536;

// ── setup parameters ──

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SqRingOffsets {
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
#[derive(Debug, Clone, Copy, Default)]
pub struct CqRingOffsets {
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

/// `struct io_uring_params`. Filled in by the kernel on setup.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

const _: () = assert!(std::mem::size_of::<RawParams>() == 120);

// ── Submission entry (64 bytes) ──

/// `struct io_uring_sqe`. `off` doubles as `addr2` and `op_flags` as the
/// per-opcode flag word (`accept_flags`, `rw_flags`, ...).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawSqe {
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
    pub _pad: u64,
}

const _: () = assert!(std::mem::size_of::<RawSqe>() == 64);

impl RawSqe {
    /// Encode a tagged submission into the kernel layout. The entry must
    /// already be zeroed; only the fields the opcode reads are written.
    pub fn prepare(&mut self, sub: &Submission) {
        self.flags = sub.flags;
        self.ioprio = sub.priority;
        self.user_data = sub.token.0;
        self.fd = sub.op.fd();

        match sub.op {
            Operation::Nop => {
                self.opcode = opcode::Nop::CODE;
            }
            Operation::Read { buf, len, offset, .. } => {
                self.opcode = opcode::Read::CODE;
                self.addr = buf as u64;
                self.len = len;
                self.off = offset;
            }
            Operation::Write { buf, len, offset, .. } => {
                self.opcode = opcode::Write::CODE;
                self.addr = buf as u64;
                self.len = len;
                self.off = offset;
            }
            Operation::Readv { iov, count, offset, .. } => {
                self.opcode = opcode::Readv::CODE;
                self.addr = iov as u64;
                self.len = count;
                self.off = offset;
            }
            Operation::Writev { iov, count, offset, .. } => {
                self.opcode = opcode::Writev::CODE;
                self.addr = iov as u64;
                self.len = count;
                self.off = offset;
            }
            Operation::Accept { addr, addrlen, flags, .. } => {
                self.opcode = opcode::Accept::CODE;
                self.addr = addr as u64;
                self.off = addrlen as u64;
                self.op_flags = flags;
            }
            Operation::Connect { addr, addrlen, .. } => {
                self.opcode = opcode::Connect::CODE;
                self.addr = addr as u64;
                self.off = addrlen as u64;
            }
        }
    }
}

// ── Completion entry (16 bytes) ──

/// `struct io_uring_cqe`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

const _: () = assert!(std::mem::size_of::<RawCqe>() == 16);

// ── Syscalls ──

/// `io_uring_setup(entries, params)`. On success the kernel has filled in
/// `params` with the ring geometry.
pub fn setup(entries: u32, params: &mut RawParams) -> Result<RawFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_long,
            params as *mut RawParams as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(KringError::Setup(Errno::last_raw()));
    }
    Ok(ret as RawFd)
}

/// `io_uring_enter(fd, to_submit, min_complete, flags, NULL)`, retried on
/// `EINTR`. Returns the number of submissions the kernel consumed.
pub fn enter(fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> Result<u32> {
    loop {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_uring_enter,
                fd as libc::c_long,
                to_submit as libc::c_long,
                min_complete as libc::c_long,
                flags as libc::c_long,
                std::ptr::null::<libc::sigset_t>() as libc::c_long,
                0 as libc::c_long,
            )
        };
        if ret >= 0 {
            return Ok(ret as u32);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(KringError::Enter(e as i32)),
        }
    }
}
