//! `SubmissionRing`: the producer side of an io_uring.
//!
//! # Ownership
//!
//! - **Tail:** ours. Advanced locally by `next()`, published by `submit()`.
//! - **Head:** the kernel's. Read with Acquire to learn how many entries
//!   it has consumed.
//!
//! The ring is not internally synchronized. Every method that moves the
//! tail takes `&mut self`, so the owner (the service, under its
//! submission lock) is the only one who can fill and publish entries.
//!
//! # Memory layout
//!
//! ```text
//! SQ ring map:   head | tail | ring_mask | ring_entries | flags | dropped | [array]
//! SQE map:       io_uring_sqe[ring_entries]   (64 bytes each)
//! ```
//!
//! With `IORING_SETUP_NO_SQARRAY` the kernel indexes the SQE array by
//! `head & mask` directly. Without it, the indirection array is filled
//! once with the identity mapping and the effect is the same.

use std::os::unix::io::RawFd;

use kring_core::error::{KringError, Result};

use crate::cursor::SharedCursor;
use crate::mmap::RingMap;
use crate::sys::{self, RawSqe, SqRingOffsets, SQ_MAX_ENTRIES};

pub struct SubmissionRing {
    fd: RawFd,
    head: SharedCursor,
    tail: SharedCursor,
    flags: SharedCursor,
    dropped: SharedCursor,
    sqes: *mut RawSqe,
    mask: u32,
    capacity: u32,
    /// Tail as advanced by `next()`; ahead of the shared tail until
    /// `submit()` publishes it.
    tail_local: u32,
    _sqe_map: RingMap,
    _ring_map: RingMap,
}

// Safety: the ring owns both mappings; the raw pointers stay inside them.
unsafe impl Send for SubmissionRing {}

impl SubmissionRing {
    /// Assemble a ring from its two mappings.
    ///
    /// `indirection` fills the SQ index array with the identity mapping;
    /// pass it when the ring was set up without `IORING_SETUP_NO_SQARRAY`.
    ///
    /// # Safety
    ///
    /// - `ring` must hold an SQ ring laid out as `off` describes.
    /// - `sqes` must be the matching SQE array.
    /// - Nothing else may advance the tail while this ring exists.
    pub unsafe fn from_maps(
        fd: RawFd,
        ring: RingMap,
        sqes: RingMap,
        off: &SqRingOffsets,
        indirection: bool,
    ) -> Result<Self> {
        let capacity = ring.value(off.ring_entries);
        let mask = ring.value(off.ring_mask);

        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(KringError::Layout("sq ring_entries not a power of 2"));
        }
        if mask != capacity - 1 {
            return Err(KringError::Layout("sq ring_mask mismatch"));
        }
        if capacity > SQ_MAX_ENTRIES {
            return Err(KringError::Layout("sq ring_entries above kernel maximum"));
        }
        if sqes.len() < capacity as usize * std::mem::size_of::<RawSqe>() {
            return Err(KringError::Layout("sqe map too small"));
        }

        if indirection {
            for i in 0..capacity {
                std::ptr::write_volatile(ring.at::<u32>(off.array + i * 4), i);
            }
        }

        let tail = ring.cursor(off.tail);
        Ok(Self {
            fd,
            head: ring.cursor(off.head),
            tail_local: tail.relaxed(),
            tail,
            flags: ring.cursor(off.flags),
            dropped: ring.cursor(off.dropped),
            sqes: sqes.as_ptr() as *mut RawSqe,
            mask,
            capacity,
            _sqe_map: sqes,
            _ring_map: ring,
        })
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Entries written but not yet consumed by the kernel. Approximate:
    /// the kernel may consume more while this runs.
    #[inline]
    pub fn pending(&self) -> u32 {
        self.tail_local.wrapping_sub(self.head.acquire())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.pending() >= self.capacity
    }

    /// Claim the next entry, zeroed. Not visible to the kernel until
    /// `submit()`.
    ///
    /// Panics if the ring is full.
    pub fn next(&mut self) -> &mut RawSqe {
        assert!(!self.is_full(), "submission ring full ({} entries)", self.capacity);
        let idx = (self.tail_local & self.mask) as usize;
        self.tail_local = self.tail_local.wrapping_add(1);
        // Safety: idx <= mask < capacity, and the kernel does not read
        // past the shared tail, which still excludes this slot.
        let sqe = unsafe { &mut *self.sqes.add(idx) };
        *sqe = RawSqe::default();
        sqe
    }

    /// Publish the local tail. Returns the number of entries the kernel
    /// has yet to consume.
    ///
    /// Panics if there is nothing to publish.
    pub fn publish(&mut self) -> u32 {
        assert!(!self.is_empty(), "submit on an empty submission ring");
        self.tail.release(self.tail_local);
        self.pending()
    }

    /// Publish and ask the kernel to consume everything pending, without
    /// waiting for completions. Returns how many entries it consumed.
    pub fn submit(&mut self) -> Result<u32> {
        let to_submit = self.publish();
        sys::enter(self.fd, to_submit, 0, 0)
    }

    /// Withdraw the most recently claimed entry.
    ///
    /// Only sound while the kernel cannot be reading the ring concurrently
    /// (no SQPOLL thread) and the entry has not been consumed, i.e. right
    /// after a failed `submit()`.
    pub fn retract(&mut self) {
        assert!(!self.is_empty(), "retract on an empty submission ring");
        self.tail_local = self.tail_local.wrapping_sub(1);
        self.tail.release(self.tail_local);
    }

    /// Shared head, as last published by the kernel.
    #[inline]
    pub fn head(&self) -> u32 {
        self.head.acquire()
    }

    /// Entries the kernel rejected as invalid (`sq_off.dropped`).
    #[inline]
    pub fn dropped(&self) -> u32 {
        self.dropped.acquire()
    }

    /// `IORING_SQ_*` ring flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.acquire()
    }
}

impl std::fmt::Debug for SubmissionRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionRing")
            .field("capacity", &self.capacity)
            .field("head", &self.head.acquire())
            .field("tail", &self.tail_local)
            .finish()
    }
}
