//! Owned buffers for ring operations.
//!
//! Every operation that hands memory to the kernel takes that memory by
//! value and gives it back with the result, as a [`BufResult`]. The buffer
//! lives inside the operation until its completion has been drained, so
//! leaking an operation with `mem::forget` leaks the buffer with it and
//! the kernel can never write into memory that was freed.
//!
//! ```ignore
//! let (res, buf) = service.read(fd, vec![0u8; 4096], 0).await;
//! let n = res? as usize;
//! consume(&buf[..n]);
//! ```

use std::ops::Range;

use kring_core::error::Result;

/// Result of an operation together with the buffer it borrowed.
pub type BufResult<T, B> = (Result<T>, B);

/// Memory the kernel may read for the lifetime of an operation.
///
/// # Safety
///
/// `stable_ptr()` must point at `bytes_init()` readable bytes, and the
/// pointer must not change when the value is moved. Only heap-backed or
/// `'static` storage qualifies.
pub unsafe trait IoBuf: Send + 'static {
    fn stable_ptr(&self) -> *const u8;

    fn bytes_init(&self) -> usize;
}

/// Memory the kernel may write for the lifetime of an operation. Reads
/// fill the first `bytes_init()` bytes.
///
/// # Safety
///
/// As for [`IoBuf`], and `stable_mut_ptr()` must be writable for
/// `bytes_init()` bytes.
pub unsafe trait IoBufMut: IoBuf {
    fn stable_mut_ptr(&mut self) -> *mut u8;
}

unsafe impl IoBuf for Vec<u8> {
    fn stable_ptr(&self) -> *const u8 {
        self.as_ptr()
    }

    fn bytes_init(&self) -> usize {
        self.len()
    }
}

unsafe impl IoBufMut for Vec<u8> {
    fn stable_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_ptr()
    }
}

unsafe impl IoBuf for Box<[u8]> {
    fn stable_ptr(&self) -> *const u8 {
        self.as_ptr()
    }

    fn bytes_init(&self) -> usize {
        self.len()
    }
}

unsafe impl IoBufMut for Box<[u8]> {
    fn stable_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_ptr()
    }
}

unsafe impl IoBuf for &'static [u8] {
    fn stable_ptr(&self) -> *const u8 {
        self.as_ptr()
    }

    fn bytes_init(&self) -> usize {
        self.len()
    }
}

unsafe impl IoBuf for &'static str {
    fn stable_ptr(&self) -> *const u8 {
        self.as_ptr()
    }

    fn bytes_init(&self) -> usize {
        self.len()
    }
}

/// A window into an owned buffer. Used to continue a partial read or
/// write without copying.
#[derive(Debug)]
pub struct Slice<B> {
    buf: B,
    range: Range<usize>,
}

impl<B: IoBuf> Slice<B> {
    /// Panics if `range` reaches past `buf.bytes_init()`.
    pub fn new(buf: B, range: Range<usize>) -> Self {
        assert!(
            range.start <= range.end && range.end <= buf.bytes_init(),
            "slice {:?} out of bounds for buffer of {} bytes",
            range,
            buf.bytes_init()
        );
        Self { buf, range }
    }

    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn into_inner(self) -> B {
        self.buf
    }
}

unsafe impl<B: IoBuf> IoBuf for Slice<B> {
    fn stable_ptr(&self) -> *const u8 {
        // Safety: `new` checked the range against the buffer.
        unsafe { self.buf.stable_ptr().add(self.range.start) }
    }

    fn bytes_init(&self) -> usize {
        self.range.len()
    }
}

unsafe impl<B: IoBufMut> IoBufMut for Slice<B> {
    fn stable_mut_ptr(&mut self) -> *mut u8 {
        // Safety: as above.
        unsafe { self.buf.stable_mut_ptr().add(self.range.start) }
    }
}

/// Buffers for a vectored operation plus the iovec array describing them.
/// Both sit on the heap, so moving this keeps every pointer valid.
pub struct IoVecs<B> {
    bufs: Vec<B>,
    iovecs: Box<[libc::iovec]>,
}

// Safety: the iovecs only point into `bufs`, which is itself `Send`.
unsafe impl<B: Send> Send for IoVecs<B> {}

impl<B: IoBuf> IoVecs<B> {
    pub(crate) fn readable(bufs: Vec<B>) -> Self {
        let iovecs = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.stable_ptr().cast_mut().cast(),
                iov_len: b.bytes_init(),
            })
            .collect();
        Self { bufs, iovecs }
    }

    pub(crate) fn into_bufs(self) -> Vec<B> {
        self.bufs
    }

    pub(crate) fn as_ptr(&self) -> *const libc::iovec {
        self.iovecs.as_ptr()
    }

    pub(crate) fn count(&self) -> usize {
        self.iovecs.len()
    }
}

impl<B: IoBufMut> IoVecs<B> {
    pub(crate) fn writable(mut bufs: Vec<B>) -> Self {
        let iovecs = bufs
            .iter_mut()
            .map(|b| libc::iovec {
                iov_base: b.stable_mut_ptr().cast(),
                iov_len: b.bytes_init(),
            })
            .collect();
        Self { bufs, iovecs }
    }
}

/// A socket address the kernel reads (connect) or fills in (accept).
#[derive(Clone, Copy)]
pub struct RawAddr {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

impl RawAddr {
    pub fn new(storage: libc::sockaddr_storage, len: libc::socklen_t) -> Self {
        Self { storage, len }
    }

    /// Zeroed, with `len` set to the full capacity.
    pub fn empty() -> Self {
        Self {
            // Safety: all-zero is a valid sockaddr_storage.
            storage: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }
}

impl std::fmt::Debug for RawAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAddr")
            .field("family", &self.storage.ss_family)
            .field("len", &self.len)
            .finish()
    }
}
