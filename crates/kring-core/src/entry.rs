//! Submission and completion vocabulary.
//!
//! A `Submission` is the safe, tagged form of one kernel request. Only the
//! fields meaningful for its opcode exist, so the aliased storage of the
//! kernel descriptor never leaks into callers. `kring-module` encodes it
//! into the 64-byte kernel layout.
//!
//! The `Token` is the sole correlation between a submission and its
//! completion: it is written into the descriptor's user-data word and the
//! kernel echoes it back untouched.

use std::ffi::c_void;
use std::fmt;
use std::os::unix::io::RawFd;

use crate::error::{KringError, Result};

// ── Token ──

/// Correlation handle for one in-flight operation.
///
/// Layout: `generation << 32 | slot index`. The slot index addresses a
/// completion slot that is stable for the owner's whole lifetime; the
/// generation rejects completions that outlive the slot's reuse.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

impl Token {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

// ── Operation ──

/// One kernel request, keyed by opcode.
///
/// Pointers are borrowed from the submitter and must stay valid until the
/// matching completion has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Nop,
    Read {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
    },
    Write {
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
    },
    /// `iov` points at `count` iovec-compatible slices.
    Readv {
        fd: RawFd,
        iov: *const c_void,
        count: u32,
        offset: u64,
    },
    Writev {
        fd: RawFd,
        iov: *const c_void,
        count: u32,
        offset: u64,
    },
    /// `addr`/`addrlen` receive the peer address; both may be null.
    Accept {
        fd: RawFd,
        addr: *mut c_void,
        addrlen: *mut u32,
        flags: u32,
    },
    Connect {
        fd: RawFd,
        addr: *const c_void,
        addrlen: u32,
    },
}

impl Operation {
    /// Short lowercase name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Readv { .. } => "readv",
            Self::Writev { .. } => "writev",
            Self::Accept { .. } => "accept",
            Self::Connect { .. } => "connect",
        }
    }

    /// Target descriptor, `-1` for operations without one.
    pub fn fd(&self) -> RawFd {
        match *self {
            Self::Nop => -1,
            Self::Read { fd, .. }
            | Self::Write { fd, .. }
            | Self::Readv { fd, .. }
            | Self::Writev { fd, .. }
            | Self::Accept { fd, .. }
            | Self::Connect { fd, .. } => fd,
        }
    }
}

/// Submission-entry flags (`IOSQE_*`).
pub mod sqe_flags {
    pub const FIXED_FILE: u8 = 1 << 0;
    pub const IO_DRAIN: u8 = 1 << 1;
    pub const IO_LINK: u8 = 1 << 2;
    pub const IO_HARDLINK: u8 = 1 << 3;
    pub const ASYNC: u8 = 1 << 4;
}

// ── Submission ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub op: Operation,
    pub token: Token,
    pub priority: u16,
    pub flags: u8,
}

// Safety: the raw pointers inside `Operation` are plain addresses handed
// to the kernel; the submitter guarantees they outlive the operation, and
// nothing dereferences them on the submitting side.
unsafe impl Send for Submission {}
unsafe impl Sync for Submission {}

impl Submission {
    pub fn new(op: Operation, token: Token) -> Self {
        Self {
            op,
            token,
            priority: 0,
            flags: 0,
        }
    }

    pub fn priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }
}

// ── Completion ──

/// A copied-out completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
    /// Negative errno on failure, byte count or descriptor on success.
    pub result: i32,
    pub flags: u32,
}

impl Completion {
    /// Split the signed kernel result into a value or an OS error.
    pub fn into_result(self) -> Result<u32> {
        if self.result < 0 {
            Err(KringError::Os(-self.result))
        } else {
            Ok(self.result as u32)
        }
    }
}
