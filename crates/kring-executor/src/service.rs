//! `Service`: the async I/O façade over one io_uring.
//!
//! ```text
//!  op.await ──first poll──▶ acquire token, park waker
//!                           executor.execute(submit)  ──▶ [sq lock] next, prepare, submit, pending += 1
//!            ◀── Pending
//!
//!  run_one() ──[cq lock] wait(1), copy record, seen(), pending -= 1
//!            ──executor.execute(resume) ──▶ slot ← result, wake
//!
//!  op.await ──second poll──▶ take result, release token ──▶ Ready
//! ```
//!
//! Completions are drained only by `run_one()`/`run()` (or `block_on`,
//! which calls them); nothing runs in the background. A drain first
//! pushes any entries the kernel has not consumed yet. Submission and
//! resumption both go through the executor, so its policy decides where
//! that work happens.
//!
//! # Bandwidth
//!
//! At most `bandwidth()` operations may be in flight. Submitting while
//! `busy()` is a programming error and panics: the service asserts rather
//! than queueing excess work.
//!
//! # Buffers
//!
//! Operations take their buffers by value ([`IoBuf`], [`IoBufMut`]) and
//! return them alongside the result, so the kernel only ever touches
//! memory the operation owns.

use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::Thread;

use kring_core::entry::{Completion, Operation, Submission, Token};
use kring_core::error::{KringError, Result};
use kring_core::executor::Executor;
use kring_core::{kdebug, ktrace, kwarn};
use kring_module::handle::Handle;
use kring_module::uring::{Uring, UringConfig};
use kring_module::{CompletionRing, InlineExecutor, SubmissionRing};

use crate::buf::{BufResult, IoBuf, IoBufMut, IoVecs, RawAddr};
use crate::config::ServiceBuilder;
use crate::op::Op;
use crate::token::TokenSlab;

pub struct Service<E: Executor = InlineExecutor> {
    shared: Arc<Shared>,
    executor: E,
}

impl<E: Executor> Clone for Service<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            executor: self.executor.clone(),
        }
    }
}

pub(crate) struct Shared {
    sq: Mutex<SubmissionRing>,
    cq: Mutex<CompletionRing>,
    tokens: TokenSlab,
    pending: AtomicU32,
    bandwidth: u32,
    /// Threads in `block_on` waiting for something to be submitted.
    parked: Mutex<Vec<Thread>>,
    /// Last: closed after both rings are unmapped.
    handle: Handle,
}

/// Ring locks guard plain data; a panic while holding one cannot leave
/// it half-updated in a way later users could observe.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<E: Executor> Service<E> {
    /// A service allowing `bandwidth` concurrent operations.
    pub fn new(executor: E, bandwidth: u32) -> Result<Self> {
        ServiceBuilder::new().bandwidth(bandwidth).build(executor)
    }

    pub(crate) fn with_config(executor: E, config: &ServiceBuilder) -> Result<Self> {
        let uring = Uring::setup(&UringConfig {
            sq_entries: config.bandwidth,
            cq_entries: config.bandwidth,
            no_sq_array: config.no_sq_array,
            clamp: config.clamp,
        })?;
        let (handle, sq, cq) = uring.into_parts();

        let bandwidth = config.bandwidth.min(sq.capacity()).min(cq.capacity());
        if bandwidth < config.bandwidth {
            kwarn!("bandwidth clamped from {} to {}", config.bandwidth, bandwidth);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                sq: Mutex::new(sq),
                cq: Mutex::new(cq),
                tokens: TokenSlab::new(bandwidth as usize),
                pending: AtomicU32::new(0),
                bandwidth,
                parked: Mutex::new(Vec::new()),
                handle,
            }),
            executor,
        })
    }

    // ── Introspection ──

    /// Operations submitted and not yet drained.
    #[inline]
    pub fn pending(&self) -> u32 {
        self.shared.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn bandwidth(&self) -> u32 {
        self.shared.bandwidth
    }

    #[inline]
    pub fn idle(&self) -> bool {
        self.pending() == 0
    }

    /// At capacity: one more submission would violate the bandwidth.
    #[inline]
    pub fn busy(&self) -> bool {
        self.pending() >= self.shared.bandwidth
    }

    #[inline]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    #[inline]
    pub fn ring_fd(&self) -> RawFd {
        self.shared.handle.raw()
    }

    pub(crate) fn tokens(&self) -> &TokenSlab {
        &self.shared.tokens
    }

    // ── Operations ──

    pub fn nop(&self) -> Op<'_, E, (), Result<()>> {
        Op::new(self, Operation::Nop, (), |res, ()| res.map(|_| ()))
    }

    /// Read into `buf` at `offset`, filling at most `buf.bytes_init()`
    /// bytes. Offset 0 on a pipe or socket reads from the stream. Resolves
    /// to the byte count, 0 at end of file, and the buffer.
    pub fn read<B: IoBufMut>(&self, fd: RawFd, mut buf: B, offset: u64) -> Op<'_, E, B, BufResult<u32, B>> {
        let op = Operation::Read {
            fd,
            buf: buf.stable_mut_ptr(),
            len: clamp_len(buf.bytes_init()),
            offset,
        };
        Op::new(self, op, buf, |res, buf| (res, buf))
    }

    pub fn write<B: IoBuf>(&self, fd: RawFd, buf: B, offset: u64) -> Op<'_, E, B, BufResult<u32, B>> {
        let op = Operation::Write {
            fd,
            buf: buf.stable_ptr(),
            len: clamp_len(buf.bytes_init()),
            offset,
        };
        Op::new(self, op, buf, |res, buf| (res, buf))
    }

    /// Scatter read: fills `bufs` in order.
    pub fn readv<B: IoBufMut>(
        &self,
        fd: RawFd,
        bufs: Vec<B>,
        offset: u64,
    ) -> Op<'_, E, IoVecs<B>, BufResult<u32, Vec<B>>> {
        let vecs = IoVecs::writable(bufs);
        let op = Operation::Readv {
            fd,
            iov: vecs.as_ptr().cast(),
            count: clamp_len(vecs.count()),
            offset,
        };
        Op::new(self, op, vecs, |res, vecs| (res, vecs.into_bufs()))
    }

    /// Gather write: sends `bufs` in order.
    pub fn writev<B: IoBuf>(
        &self,
        fd: RawFd,
        bufs: Vec<B>,
        offset: u64,
    ) -> Op<'_, E, IoVecs<B>, BufResult<u32, Vec<B>>> {
        let vecs = IoVecs::readable(bufs);
        let op = Operation::Writev {
            fd,
            iov: vecs.as_ptr().cast(),
            count: clamp_len(vecs.count()),
            offset,
        };
        Op::new(self, op, vecs, |res, vecs| (res, vecs.into_bufs()))
    }

    /// Accept on listening socket `fd`. Resolves to the new descriptor,
    /// close-on-exec, and the peer address.
    pub fn accept(&self, fd: RawFd) -> Op<'_, E, Box<RawAddr>, Result<(RawFd, RawAddr)>> {
        let mut peer = Box::new(RawAddr::empty());
        let op = Operation::Accept {
            fd,
            addr: (&mut peer.storage as *mut libc::sockaddr_storage).cast(),
            addrlen: &mut peer.len,
            flags: libc::SOCK_CLOEXEC as u32,
        };
        Op::new(self, op, peer, |res, peer| res.map(|fd| (fd as RawFd, *peer)))
    }

    pub fn connect(&self, fd: RawFd, addr: RawAddr) -> Op<'_, E, Box<RawAddr>, Result<()>> {
        let addr = Box::new(addr);
        let op = Operation::Connect {
            fd,
            addr: (&addr.storage as *const libc::sockaddr_storage).cast(),
            addrlen: addr.len,
        };
        Op::new(self, op, addr, |res, _| res.map(|_| ()))
    }

    // ── Submission ──

    /// Hand `sub` to the executor for submission.
    pub(crate) fn submit(&self, sub: Submission) {
        let shared = Arc::clone(&self.shared);
        self.executor.execute(move || shared.submit(sub));
    }

    // ── Draining ──

    /// Drain one completion, waiting for it if necessary, and hand its
    /// resumption to the executor. No-op when idle.
    pub fn run_one(&self) -> Result<()> {
        if self.idle() {
            return Ok(());
        }
        self.shared.flush()?;

        let completion = {
            let mut cq = lock(&self.shared.cq);
            if cq.is_empty() {
                // Another drainer may have taken the last one.
                if self.idle() {
                    return Ok(());
                }
                cq.wait(1)?;
            }
            let cqe = *cq.next();
            cq.seen();
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            Completion {
                token: Token(cqe.user_data),
                result: cqe.res,
                flags: cqe.flags,
            }
        };

        ktrace!("complete token={} res={}", completion.token, completion.result);
        let shared = Arc::clone(&self.shared);
        self.executor.execute(move || shared.resume(completion));
        Ok(())
    }

    /// Drain until nothing is in flight.
    pub fn run(&self) -> Result<()> {
        while !self.idle() {
            self.run_one()?;
        }
        Ok(())
    }

    /// Drive `future` to completion on this thread, draining completions
    /// whenever it is waiting on one.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let mut future = pin!(future);
        let signal = Arc::new(Signal {
            woken: AtomicBool::new(false),
            thread: std::thread::current(),
        });
        let waker = Waker::from(Arc::clone(&signal));
        let mut cx = Context::from_waker(&waker);

        loop {
            if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
                return Ok(out);
            }
            while !signal.woken.swap(false, Ordering::AcqRel) {
                if self.idle() {
                    // Waiting on something other than this ring, or on a
                    // submission still with the executor.
                    self.shared.park_while_idle();
                } else {
                    self.run_one()?;
                }
            }
        }
    }
}

impl Shared {
    /// Runs on the executor: enqueue one descriptor and tell the kernel.
    fn submit(&self, sub: Submission) {
        let mut sq = lock(&self.sq);
        sq.next().prepare(&sub);
        // Counted before the kernel sees it, so a concurrent drainer
        // never observes a completion it has not been told about.
        self.pending.fetch_add(1, Ordering::AcqRel);

        match sq.submit() {
            Ok(0) => {
                kwarn!("kernel deferred {} token={}; flushed on next drain", sub.op.name(), sub.token);
            }
            Ok(_) => {
                ktrace!("submit {} fd={} token={}", sub.op.name(), sub.op.fd(), sub.token);
            }
            Err(e) => {
                if !sq.is_empty() {
                    sq.retract();
                    drop(sq);
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    kwarn!("submit {} token={} failed: {}", sub.op.name(), sub.token, e);
                    if let Some(waker) = self.tokens.complete(sub.token, Err(e)) {
                        waker.wake();
                    }
                    return;
                }
                // Consumed despite the error: it will complete normally.
            }
        }
        drop(sq);
        self.unpark_idle();
    }

    /// Push entries the kernel has not consumed yet. A busy ring is not
    /// an error here: the entries stay queued for the next drain.
    fn flush(&self) -> Result<()> {
        let mut sq = lock(&self.sq);
        if sq.is_empty() {
            return Ok(());
        }
        match sq.submit() {
            Ok(n) => {
                ktrace!("flushed {} deferred entries", n);
                Ok(())
            }
            Err(KringError::Enter(libc::EBUSY | libc::EAGAIN)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Park the calling thread until something is submitted or it is
    /// unparked for another reason.
    fn park_while_idle(&self) {
        let me = std::thread::current();
        {
            let mut parked = lock(&self.parked);
            // Submitters count themselves before taking this lock.
            if self.pending.load(Ordering::Acquire) != 0 {
                return;
            }
            parked.push(me.clone());
        }
        std::thread::park();
        lock(&self.parked).retain(|t| t.id() != me.id());
    }

    fn unpark_idle(&self) {
        for thread in lock(&self.parked).iter() {
            thread.unpark();
        }
    }

    /// Runs on the executor: deliver a completion and wake its future.
    fn resume(&self, completion: Completion) {
        if let Some(waker) = self.tokens.complete(completion.token, completion.into_result()) {
            waker.wake();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let pending = *self.pending.get_mut();
        if pending > 0 {
            kwarn!("service dropped with {} operations in flight", pending);
        }
        kdebug!("service on ring fd={} shut down", self.handle.raw());
    }
}

/// Wakes the thread running `block_on`.
struct Signal {
    woken: AtomicBool,
    thread: Thread,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

fn clamp_len(n: usize) -> u32 {
    n.min(u32::MAX as usize) as u32
}
