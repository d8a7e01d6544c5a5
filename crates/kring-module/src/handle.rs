//! `Handle`: an owned kernel descriptor, closed exactly once.

use std::os::unix::io::{AsRawFd, RawFd};

use kring_core::kwarn;

pub struct Handle {
    fd: RawFd,
}

impl Handle {
    pub const INVALID: RawFd = -1;

    /// Take ownership of `fd`.
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    #[inline]
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// Give up ownership without closing.
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, Self::INVALID)
    }

    /// Close the current descriptor (if any) and adopt `fd`.
    pub fn reset(&mut self, fd: RawFd) {
        let old = std::mem::replace(&mut self.fd, fd);
        close_fd(old);
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new(Self::INVALID)
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.fd)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let fd = self.release();
        close_fd(fd);
    }
}

fn close_fd(fd: RawFd) {
    if fd < 0 {
        return;
    }
    if let Err(e) = nix::unistd::close(fd) {
        kwarn!("close({}) failed: {}", fd, e.desc());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::io::{FromRawFd, IntoRawFd};

    /// Read end as a `File`, write end as a bare descriptor.
    fn pipe() -> (File, RawFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (File::from(r), w.into_raw_fd())
    }

    // A pipe reads EOF only once every write end is closed.
    fn write_end_closed(r: &mut File) -> bool {
        let mut b = [0u8; 1];
        matches!(r.read(&mut b), Ok(0))
    }

    #[test]
    fn test_drop_closes() {
        let (mut r, w) = pipe();
        {
            let h = Handle::new(w);
            assert!(h.is_valid());
            assert_eq!(h.raw(), w);
        }
        assert!(write_end_closed(&mut r));
    }

    #[test]
    fn test_release_keeps_open() {
        let (mut r, w) = pipe();
        let mut h = Handle::new(w);
        assert_eq!(h.release(), w);
        assert!(!h.is_valid());
        drop(h);

        let mut still_open = unsafe { File::from_raw_fd(w) };
        still_open.write_all(b"k").unwrap();
        let mut b = [0u8; 1];
        r.read_exact(&mut b).unwrap();
        assert_eq!(&b, b"k");
    }

    #[test]
    fn test_reset_closes_previous() {
        let (mut r1, w1) = pipe();
        let (_r2, w2) = pipe();
        let mut h = Handle::new(w1);
        h.reset(w2);
        assert!(write_end_closed(&mut r1));
        assert_eq!(h.raw(), w2);
    }

    #[test]
    fn test_default_is_invalid() {
        let h = Handle::default();
        assert!(!h.is_valid());
        assert_eq!(h.as_raw_fd(), Handle::INVALID);
    }
}
