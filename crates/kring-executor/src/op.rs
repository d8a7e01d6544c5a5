//! `Op`: the future for one ring operation.
//!
//! ```text
//! [Unsubmitted] ──first poll: token, park waker, executor submits──▶ [Submitted]
//! [Submitted]   ──kernel posts completion──▶ [Completed]
//! [Completed]   ──run_one: slot ← result, wake──▶ [Resumed]
//! [Resumed]     ──poll: take result, release token──▶ Ready
//! ```
//!
//! There is no cancellation. Dropping an `Op` after it was submitted
//! drains the service until that operation has completed, because the
//! kernel may still be writing into its buffer until then. The buffer is
//! owned by the `Op`, so an `Op` leaked with `mem::forget` leaks its
//! buffer too instead of freeing memory the kernel still targets.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use kring_core::entry::{Operation, Submission, Token};
use kring_core::error::Result;
use kring_core::executor::Executor;
use kring_core::{kerror, kwarn};

use crate::service::Service;

/// Spins with nothing in flight before a dropped operation reports that
/// its submission has not reached the ring.
const STALL_WARN_SPINS: u32 = 1 << 20;

#[must_use = "operations do nothing unless awaited or polled"]
pub struct Op<'a, E: Executor, R, T> {
    service: &'a Service<E>,
    /// Present until the first poll.
    submission: Option<Submission>,
    /// Present while submitted and unobserved.
    token: Option<Token>,
    /// Memory the kernel reads or writes. Handed back with the result.
    resource: Option<R>,
    map: fn(Result<u32>, R) -> T,
}

// Nothing the kernel sees lives inline: `resource` is heap-backed.
impl<E: Executor, R, T> Unpin for Op<'_, E, R, T> {}

impl<'a, E: Executor, R, T> Op<'a, E, R, T> {
    pub(crate) fn new(service: &'a Service<E>, op: Operation, resource: R, map: fn(Result<u32>, R) -> T) -> Self {
        Self {
            service,
            submission: Some(Submission::new(op, Token(0))),
            token: None,
            resource: Some(resource),
            map,
        }
    }

    /// I/O priority (`ioprio`) for the submission. No effect once polled.
    pub fn priority(mut self, priority: u16) -> Self {
        if let Some(sub) = self.submission.take() {
            self.submission = Some(sub.priority(priority));
        }
        self
    }

    /// `IOSQE_*` flags for the submission. No effect once polled.
    pub fn flags(mut self, flags: u8) -> Self {
        if let Some(sub) = self.submission.take() {
            self.submission = Some(sub.flags(flags));
        }
        self
    }

    /// Token of the in-flight submission, if any.
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    fn start(&mut self, cx: &Context<'_>) -> Token {
        let service = self.service;
        assert!(
            !service.busy(),
            "submission with {} operations in flight exceeds bandwidth {}",
            service.pending(),
            service.bandwidth()
        );
        let Some(mut sub) = self.submission.take() else {
            panic!("Op polled after completion");
        };
        let tokens = service.tokens();
        let token = tokens.acquire();
        sub.token = token;
        self.token = Some(token);

        // Park before submitting: an inline failure completes the slot
        // during `submit`.
        let _ = tokens.poll(token, cx.waker());
        service.submit(sub);
        token
    }
}

impl<E: Executor, R, T> Future for Op<'_, E, R, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let token = match this.token {
            Some(token) => token,
            None => this.start(cx),
        };

        match this.service.tokens().poll(token, cx.waker()) {
            Poll::Ready(result) => {
                this.service.tokens().release(token);
                this.token = None;
                let Some(resource) = this.resource.take() else {
                    panic!("Op polled after completion");
                };
                Poll::Ready((this.map)(result, resource))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<E: Executor, R, T> Drop for Op<'_, E, R, T> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let tokens = self.service.tokens();
        tokens.disarm(token);

        let mut idle_spins = 0u32;
        while !tokens.is_done(token) {
            if self.service.idle() {
                // Submission still queued on another executor.
                idle_spins = idle_spins.wrapping_add(1);
                if idle_spins == STALL_WARN_SPINS {
                    kwarn!(
                        "dropped operation {} still waiting for its submission to reach the ring",
                        token
                    );
                }
                std::thread::yield_now();
                continue;
            }
            if let Err(e) = self.service.run_one() {
                // The slot and the buffer stay held: the kernel may
                // still write into it.
                kerror!("draining dropped operation {} failed: {}", token, e);
                if let Some(resource) = self.resource.take() {
                    std::mem::forget(resource);
                }
                return;
            }
        }
        tokens.release(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{counting_waker, pipe, service_or_skip, service_or_skip_with, DeferredExecutor};
    use kring_core::entry::sqe_flags;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_await_nop() {
        let Some(service) = service_or_skip(2) else { return };
        assert_eq!(service.block_on(service.nop()).unwrap(), Ok(()));
        assert!(service.idle());
    }

    #[test]
    fn test_token_assigned_on_first_poll_and_cleared_on_ready() {
        let Some(service) = service_or_skip(2) else { return };
        let (_, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        let mut op = service.nop().priority(1).flags(sqe_flags::ASYNC);
        assert!(op.token().is_none());
        assert!(Pin::new(&mut op).poll(&mut cx).is_pending());
        assert!(op.token().is_some());

        service.run_one().unwrap();
        assert_eq!(Pin::new(&mut op).poll(&mut cx), Poll::Ready(Ok(())));
        assert!(op.token().is_none());
    }

    #[test]
    fn test_drop_before_poll_submits_nothing() {
        let Some(service) = service_or_skip(2) else { return };
        let op = service.nop();
        drop(op);
        assert!(service.idle());
        assert_eq!(service.tokens().available(), 2);
    }

    #[test]
    #[should_panic(expected = "polled after completion")]
    fn test_poll_after_ready_panics() {
        let Some(service) = service_or_skip(1) else {
            panic!("polled after completion (io_uring unavailable)");
        };
        let (_, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut op = service.nop();
        let _ = Pin::new(&mut op).poll(&mut cx);
        service.run().unwrap();
        assert!(Pin::new(&mut op).poll(&mut cx).is_ready());
        let _ = Pin::new(&mut op).poll(&mut cx);
    }

    #[test]
    fn test_submit_after_drain_before_first_op_is_repolled() {
        let Some(service) = service_or_skip(1) else { return };
        let (_, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        let mut first = service.nop();
        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());
        service.run_one().unwrap();
        assert!(!service.busy());

        // `first` still holds its slot; only `pending` gates submission.
        let mut second = service.nop();
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());
        assert!(service.busy());
        service.run().unwrap();

        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(Ok(())));
        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Ready(Ok(())));
        assert_eq!(service.tokens().available(), service.tokens().capacity());
    }

    #[test]
    fn test_forgotten_read_keeps_its_buffer() {
        let Some(service) = service_or_skip(2) else { return };
        let (r, mut w) = pipe();
        let (_, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        let mut op = service.read(r.as_raw_fd(), vec![0u8; 64], 0);
        assert!(Pin::new(&mut op).poll(&mut cx).is_pending());
        std::mem::forget(op);

        // Fresh allocations of the same size would land on a freed buffer.
        let scratch: Vec<Vec<u8>> = (0..64).map(|_| vec![0xa5u8; 64]).collect();
        w.write_all(b"written after the op was forgotten").unwrap();
        service.run().unwrap();

        assert!(service.idle());
        assert!(scratch.iter().all(|v| v.iter().all(|&b| b == 0xa5)));
    }

    #[test]
    fn test_drop_waits_for_submission_on_another_thread() {
        let Some(service) = service_or_skip_with(DeferredExecutor, 2) else { return };
        let (_, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        let mut op = service.nop();
        assert!(Pin::new(&mut op).poll(&mut cx).is_pending());
        drop(op);

        assert!(service.idle());
        assert_eq!(service.tokens().available(), service.tokens().capacity());
    }
}
