//! `CompletionRing`: the consumer side of an io_uring.
//!
//! - **Tail:** the kernel's. Read with Acquire; every entry below it is
//!   fully written.
//! - **Head:** ours. Advanced by `seen()` and published with Release so
//!   the kernel may reuse the slot only after we are done reading it.
//!
//! `next()` peeks without consuming. Callers copy the record out, call
//! `seen()`, and only then act on it, so the slot is never referenced
//! after it has been handed back.

use std::os::unix::io::RawFd;

use kring_core::error::{KringError, Result};

use crate::cursor::SharedCursor;
use crate::mmap::RingMap;
use crate::sys::{self, CqRingOffsets, RawCqe, CQ_MAX_ENTRIES, IORING_ENTER_GETEVENTS};

pub struct CompletionRing {
    fd: RawFd,
    head: SharedCursor,
    tail: SharedCursor,
    overflow: SharedCursor,
    cqes: *const RawCqe,
    mask: u32,
    capacity: u32,
    head_local: u32,
    _map: RingMap,
}

// Safety: the ring owns its mapping; `cqes` points inside it.
unsafe impl Send for CompletionRing {}

impl CompletionRing {
    /// # Safety
    ///
    /// `map` must hold a CQ ring laid out as `off` describes, and nothing
    /// else may advance its head while this ring exists.
    pub unsafe fn from_map(fd: RawFd, map: RingMap, off: &CqRingOffsets) -> Result<Self> {
        let capacity = map.value(off.ring_entries);
        let mask = map.value(off.ring_mask);

        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(KringError::Layout("cq ring_entries not a power of 2"));
        }
        if mask != capacity - 1 {
            return Err(KringError::Layout("cq ring_mask mismatch"));
        }
        if capacity > CQ_MAX_ENTRIES {
            return Err(KringError::Layout("cq ring_entries above kernel maximum"));
        }
        // Bounds-checks the whole CQE array.
        let _ = map.at::<RawCqe>(off.cqes + (capacity - 1) * std::mem::size_of::<RawCqe>() as u32);

        let head = map.cursor(off.head);
        Ok(Self {
            fd,
            head_local: head.relaxed(),
            head,
            tail: map.cursor(off.tail),
            overflow: map.cursor(off.overflow),
            cqes: map.at::<RawCqe>(off.cqes),
            mask,
            capacity,
            _map: map,
        })
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Completions produced by the kernel and not yet `seen()`.
    #[inline]
    pub fn pending(&self) -> u32 {
        self.tail.acquire().wrapping_sub(self.head_local)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.pending() >= self.capacity
    }

    /// Block until at least `n` completions are available.
    pub fn wait(&self, n: u32) -> Result<()> {
        while self.pending() < n {
            sys::enter(self.fd, 0, n, IORING_ENTER_GETEVENTS)?;
        }
        Ok(())
    }

    /// The oldest unconsumed completion. Does not advance; repeated calls
    /// return the same record until `seen()`.
    ///
    /// Panics if the ring is empty.
    pub fn next(&self) -> &RawCqe {
        assert!(!self.is_empty(), "next on an empty completion ring");
        let idx = (self.head_local & self.mask) as usize;
        // Safety: idx < capacity, and the slot is below the kernel's
        // tail, so it is fully written and ours until `seen()`.
        unsafe { &*self.cqes.add(idx) }
    }

    /// Hand the record returned by `next()` back to the kernel.
    ///
    /// Panics if the ring is empty.
    pub fn seen(&mut self) {
        assert!(!self.is_empty(), "seen on an empty completion ring");
        self.head_local = self.head_local.wrapping_add(1);
        self.head.release(self.head_local);
    }

    /// Completions the kernel had to drop because the ring was full.
    #[inline]
    pub fn overflow(&self) -> u32 {
        self.overflow.acquire()
    }
}

impl std::fmt::Debug for CompletionRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRing")
            .field("capacity", &self.capacity)
            .field("head", &self.head_local)
            .field("tail", &self.tail.acquire())
            .finish()
    }
}
