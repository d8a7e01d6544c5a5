//! `RingMap`: one owned mapping of ring memory.
//!
//! A ring is assembled from one or two of these. Each unmaps itself on
//! drop, so a ring whose construction fails halfway releases whatever it
//! had already mapped.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use kring_core::error::{KringError, Result};
use nix::errno::Errno;

use crate::cursor::SharedCursor;

pub struct RingMap {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is exclusively owned; concurrent access to the
// memory inside goes through atomics or the owning ring's lock.
unsafe impl Send for RingMap {}
unsafe impl Sync for RingMap {}

impl RingMap {
    /// Map `len` bytes of the ring object `fd` at kernel offset `offset`
    /// (one of the `IORING_OFF_*` constants).
    pub fn new(fd: RawFd, offset: i64, len: usize) -> Result<Self> {
        Self::map(
            len,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            offset as libc::off_t,
        )
    }

    /// Private zero-filled memory laid out by the caller. Lets ring logic
    /// run without a kernel ring behind it.
    pub fn anonymous(len: usize) -> Result<Self> {
        Self::map(len, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1, 0)
    }

    fn map(len: usize, flags: libc::c_int, fd: RawFd, offset: libc::off_t) -> Result<Self> {
        if len == 0 {
            return Err(KringError::Mmap(libc::EINVAL));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(KringError::Mmap(Errno::last_raw()));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(KringError::Mmap(libc::EFAULT))?;
        Ok(Self { base, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Pointer to a `T` at byte `offset`. Panics if `T` would not fit.
    pub fn at<T>(&self, offset: u32) -> *mut T {
        let offset = offset as usize;
        assert!(
            offset + std::mem::size_of::<T>() <= self.len,
            "ring offset {} outside {}-byte mapping",
            offset,
            self.len
        );
        debug_assert_eq!(offset % std::mem::align_of::<T>(), 0);
        unsafe { self.base.as_ptr().add(offset) as *mut T }
    }

    /// Cursor over the `u32` at `offset`.
    pub fn cursor(&self, offset: u32) -> SharedCursor {
        // Safety: `at` bounds-checked the word; the mapping outlives every
        // ring that hands out cursors into it.
        unsafe { SharedCursor::new(self.at::<u32>(offset)) }
    }

    /// Read a field the kernel wrote once at setup (mask, entry count).
    pub fn value(&self, offset: u32) -> u32 {
        unsafe { std::ptr::read_volatile(self.at::<u32>(offset)) }
    }
}

impl Drop for RingMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for RingMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingMap")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_is_zeroed() {
        let map = RingMap::anonymous(4096).unwrap();
        assert_eq!(map.len(), 4096);
        assert_eq!(map.value(0), 0);
        assert_eq!(map.value(4092), 0);
    }

    #[test]
    fn test_cursor_and_value_alias() {
        let map = RingMap::anonymous(64).unwrap();
        map.cursor(8).release(0xabcd);
        assert_eq!(map.value(8), 0xabcd);
        unsafe { *map.at::<u32>(12) = 7 };
        assert_eq!(map.cursor(12).acquire(), 7);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_out_of_bounds_offset() {
        let map = RingMap::anonymous(64).unwrap();
        let _ = map.at::<u64>(60);
    }

    #[test]
    fn test_zero_length_rejected() {
        assert_eq!(RingMap::anonymous(0).unwrap_err(), KringError::Mmap(libc::EINVAL));
    }

    #[test]
    fn test_bad_fd_fails() {
        match RingMap::new(-1, 0, 4096) {
            Err(KringError::Mmap(e)) => assert_eq!(e, libc::EBADF),
            other => panic!("expected mmap failure, got {:?}", other.map(|m| m.len())),
        }
    }
}
