//! `Uring`: one io_uring instance: the kernel handle plus both rings.
//!
//! Setup order:
//!
//! 1. `io_uring_setup` with `CQSIZE` (and by default `CLAMP`, `NO_SQARRAY`)
//! 2. map the SQ ring, the SQE array and the CQ ring
//! 3. validate the geometry and wrap each mapping in its ring type
//!
//! Any failure drops whatever was already created, so a `Uring` either
//! exists completely or not at all. Kernels older than 6.6 reject
//! `NO_SQARRAY` with `EINVAL`; setup then retries with the indirection
//! array and fills it with the identity mapping.

use std::os::unix::io::{AsRawFd, RawFd};

use kring_core::error::{KringError, Result};
use kring_core::{kdebug, kinfo};

use crate::cqr::CompletionRing;
use crate::handle::Handle;
use crate::mmap::RingMap;
use crate::sqr::SubmissionRing;
use crate::sys::{
    self, RawCqe, RawParams, RawSqe, CQ_MAX_ENTRIES, IORING_FEAT_SINGLE_MMAP, IORING_OFF_CQ_RING,
    IORING_OFF_SQES, IORING_OFF_SQ_RING, IORING_SETUP_CLAMP, IORING_SETUP_CQSIZE,
    IORING_SETUP_NO_SQARRAY,
};

#[derive(Debug, Clone)]
pub struct UringConfig {
    /// Requested submission entries; the kernel rounds up to a power of 2.
    pub sq_entries: u32,
    /// Requested completion entries; raised to `sq_entries` if smaller.
    pub cq_entries: u32,
    /// Index the SQE array by tail directly (`IORING_SETUP_NO_SQARRAY`).
    pub no_sq_array: bool,
    /// Clamp oversized requests to kernel limits instead of failing.
    pub clamp: bool,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            cq_entries: 256,
            no_sq_array: true,
            clamp: true,
        }
    }
}

pub struct Uring {
    pub sq: SubmissionRing,
    pub cq: CompletionRing,
    pub params: RawParams,
    /// Declared last: rings unmap before the descriptor closes.
    pub handle: Handle,
}

impl Uring {
    pub fn setup(config: &UringConfig) -> Result<Self> {
        if config.sq_entries == 0 {
            return Err(KringError::InvalidConfig("sq_entries must be non-zero"));
        }
        if !config.clamp && config.cq_entries > CQ_MAX_ENTRIES {
            return Err(KringError::InvalidConfig("cq_entries above kernel maximum"));
        }

        let mut flags = IORING_SETUP_CQSIZE;
        if config.clamp {
            flags |= IORING_SETUP_CLAMP;
        }
        if config.no_sq_array {
            flags |= IORING_SETUP_NO_SQARRAY;
        }

        let (handle, params) = match create(config, flags) {
            Err(KringError::Setup(libc::EINVAL)) if flags & IORING_SETUP_NO_SQARRAY != 0 => {
                kdebug!("io_uring: NO_SQARRAY rejected, using the SQ index array");
                create(config, flags & !IORING_SETUP_NO_SQARRAY)?
            }
            other => other?,
        };

        let fd = handle.raw();
        let indirection = params.flags & IORING_SETUP_NO_SQARRAY == 0;
        let (sq_len, cq_len) = ring_lengths(&params);

        let sq_map = RingMap::new(fd, IORING_OFF_SQ_RING, sq_len)?;
        let sqe_map = RingMap::new(
            fd,
            IORING_OFF_SQES,
            params.sq_entries as usize * std::mem::size_of::<RawSqe>(),
        )?;
        let cq_map = RingMap::new(fd, IORING_OFF_CQ_RING, cq_len)?;

        // Safety: the maps come straight from this ring's fd with the
        // kernel-reported offsets, and the Uring is their only owner.
        let sq = unsafe { SubmissionRing::from_maps(fd, sq_map, sqe_map, &params.sq_off, indirection)? };
        let cq = unsafe { CompletionRing::from_map(fd, cq_map, &params.cq_off)? };

        kinfo!(
            "io_uring fd={} sq={} cq={} features={:#x}{}",
            fd,
            sq.capacity(),
            cq.capacity(),
            params.features,
            if indirection { " (sq array)" } else { "" }
        );

        Ok(Self { sq, cq, params, handle })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.handle.raw()
    }

    #[inline]
    pub fn features(&self) -> u32 {
        self.params.features
    }

    pub fn into_parts(self) -> (Handle, SubmissionRing, CompletionRing) {
        (self.handle, self.sq, self.cq)
    }
}

impl AsRawFd for Uring {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

fn create(config: &UringConfig, flags: u32) -> Result<(Handle, RawParams)> {
    let mut params = RawParams {
        flags,
        cq_entries: config.cq_entries.max(config.sq_entries),
        ..Default::default()
    };
    let fd = sys::setup(config.sq_entries, &mut params)?;
    Ok((Handle::new(fd), params))
}

/// Byte lengths of the SQ and CQ ring mappings.
///
/// With `IORING_FEAT_SINGLE_MMAP` both rings live in one kernel object, so
/// the SQ mapping is stretched to cover it. That also covers the
/// `NO_SQARRAY` case, where `sq_off.array` is zero.
fn ring_lengths(p: &RawParams) -> (usize, usize) {
    let mut sq_len = if p.flags & IORING_SETUP_NO_SQARRAY == 0 {
        p.sq_off.array as usize + p.sq_entries as usize * std::mem::size_of::<u32>()
    } else {
        0
    };
    let cq_len = p.cq_off.cqes as usize + p.cq_entries as usize * std::mem::size_of::<RawCqe>();
    if p.features & IORING_FEAT_SINGLE_MMAP != 0 || sq_len == 0 {
        sq_len = sq_len.max(cq_len);
    }
    (sq_len, cq_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kring_core::entry::{Operation, Submission, Token};

    /// io_uring may be compiled out or filtered by seccomp in CI sandboxes.
    fn setup_or_skip(config: &UringConfig) -> Option<Uring> {
        match Uring::setup(config) {
            Err(KringError::Setup(e)) if matches!(e, libc::ENOSYS | libc::EPERM | libc::EACCES) => {
                eprintln!("skipping: io_uring unavailable (errno {})", e);
                None
            }
            other => Some(other.unwrap()),
        }
    }

    fn nop_round_trip(ring: &mut Uring, token: u64) {
        ring.sq.next().prepare(&Submission::new(Operation::Nop, Token(token)));
        assert_eq!(ring.sq.submit().unwrap(), 1);
        ring.cq.wait(1).unwrap();
        let cqe = *ring.cq.next();
        ring.cq.seen();
        assert_eq!(cqe.user_data, token);
        assert_eq!(cqe.res, 0);
        assert!(ring.cq.is_empty());
    }

    #[test]
    fn test_setup_geometry() {
        let Some(ring) = setup_or_skip(&UringConfig { sq_entries: 6, cq_entries: 20, ..Default::default() }) else {
            return;
        };
        assert_eq!(ring.sq.capacity(), 8);
        assert!(ring.cq.capacity() >= 20);
        assert!(ring.cq.capacity().is_power_of_two());
        assert!(ring.fd() >= 0);
        assert!(ring.sq.is_empty());
    }

    #[test]
    fn test_nop_through_raw_rings() {
        let Some(mut ring) = setup_or_skip(&UringConfig::default()) else {
            return;
        };
        for t in 1..=3 {
            nop_round_trip(&mut ring, t);
        }
    }

    #[test]
    fn test_nop_with_sq_array() {
        let config = UringConfig { sq_entries: 4, cq_entries: 4, no_sq_array: false, clamp: true };
        let Some(mut ring) = setup_or_skip(&config) else {
            return;
        };
        assert_eq!(ring.params.flags & IORING_SETUP_NO_SQARRAY, 0);
        // Go round the ring twice so every array slot is used.
        for t in 0..8 {
            nop_round_trip(&mut ring, 100 + t);
        }
    }

    #[test]
    fn test_zero_entries_rejected() {
        let config = UringConfig { sq_entries: 0, ..Default::default() };
        assert!(matches!(Uring::setup(&config), Err(KringError::InvalidConfig(_))));
    }

    #[test]
    fn test_ring_lengths_single_mmap() {
        let mut p = RawParams::default();
        p.sq_entries = 8;
        p.cq_entries = 16;
        p.sq_off.array = 512;
        p.cq_off.cqes = 320;
        p.features = IORING_FEAT_SINGLE_MMAP;
        assert_eq!(ring_lengths(&p), (320 + 16 * 16, 320 + 16 * 16));

        p.flags = IORING_SETUP_NO_SQARRAY;
        p.sq_off.array = 0;
        assert_eq!(ring_lengths(&p).0, 320 + 16 * 16);
    }
}
