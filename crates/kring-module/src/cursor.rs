//! `SharedCursor`: a ring cursor living in kernel-shared memory.
//!
//! The kernel and this process each own one end of every ring. The end
//! we read is loaded with `Acquire` (so the entries it covers are
//! visible), the end we own is stored with `Release` (so the entries we
//! wrote, or finished reading, are published first).

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Copy)]
pub struct SharedCursor {
    ptr: *const AtomicU32,
}

// Safety: the pointee is an atomic; the mapping that backs it is owned by
// the ring holding this cursor and outlives it.
unsafe impl Send for SharedCursor {}
unsafe impl Sync for SharedCursor {}

impl SharedCursor {
    /// # Safety
    ///
    /// `ptr` must be 4-byte aligned and stay valid for as long as the
    /// cursor is used.
    pub unsafe fn new(ptr: *mut u32) -> Self {
        debug_assert!(!ptr.is_null());
        debug_assert_eq!(ptr as usize % std::mem::align_of::<AtomicU32>(), 0);
        Self { ptr: ptr as *const AtomicU32 }
    }

    #[inline(always)]
    fn atomic(&self) -> &AtomicU32 {
        unsafe { &*self.ptr }
    }

    /// Read the remote end.
    #[inline]
    pub fn acquire(&self) -> u32 {
        self.atomic().load(Ordering::Acquire)
    }

    /// Publish the owned end.
    #[inline]
    pub fn release(&self, value: u32) {
        self.atomic().store(value, Ordering::Release)
    }

    /// Read a value only this process writes.
    #[inline]
    pub fn relaxed(&self) -> u32 {
        self.atomic().load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SharedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedCursor({})", self.relaxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_release_then_acquire() {
        let mut word: u32 = 0;
        let c = unsafe { SharedCursor::new(&mut word) };
        c.release(41);
        assert_eq!(c.acquire(), 41);
        assert_eq!(c.relaxed(), 41);
        c.release(c.relaxed().wrapping_add(1));
        assert_eq!(word, 42);
    }

    #[test]
    fn test_cross_thread_publication() {
        // Producer writes a payload then releases the cursor; the consumer
        // must see the payload once it acquires the new cursor value.
        struct Shared {
            payload: std::cell::UnsafeCell<[u64; 4]>,
            tail: std::cell::UnsafeCell<u32>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            payload: std::cell::UnsafeCell::new([0; 4]),
            tail: std::cell::UnsafeCell::new(0),
        });

        let producer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || unsafe {
                let cursor = SharedCursor::new(shared.tail.get());
                *shared.payload.get() = [1, 2, 3, 4];
                cursor.release(1);
            })
        };

        let cursor = unsafe { SharedCursor::new(shared.tail.get()) };
        while cursor.acquire() == 0 {
            std::hint::spin_loop();
        }
        assert_eq!(unsafe { *shared.payload.get() }, [1, 2, 3, 4]);
        producer.join().unwrap();
    }
}
