//! Minimal task driver: `spawn` and `JoinHandle`.
//!
//! A spawned task is polled on whichever thread wakes it. With the inline
//! executor that is the thread calling `run_one()`, so a server is just
//! "spawn tasks, then `run()`". There is no queue and no worker thread.
//!
//! ```text
//!  IDLE ──wake──▶ RUNNING ──Pending──▶ IDLE
//!                  │   ▲
//!            wake  ▼   │ re-poll
//!               NOTIFIED
//!                  │
//!  RUNNING ──Ready──▶ DONE (output stored, joiner woken)
//! ```
//!
//! A wake that arrives while the task is being polled only marks it
//! NOTIFIED; the poller loops instead of recursing. A panic inside the
//! future propagates to whoever woke it and leaves the task stuck in
//! RUNNING.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake, Waker};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const DONE: u8 = 3;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct JoinState<T> {
    output: Option<T>,
    waker: Option<Waker>,
}

struct Task<T> {
    state: AtomicU8,
    future: Mutex<Option<BoxFuture<T>>>,
    join: Mutex<JoinState<T>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Send + 'static> Task<T> {
    fn schedule(self: &Arc<Self>) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => RUNNING,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self.state.compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) if next == RUNNING => return self.run(),
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }

    fn run(self: &Arc<Self>) {
        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        loop {
            let polled = {
                let mut slot = lock(&self.future);
                match slot.as_mut() {
                    Some(fut) => {
                        let polled = fut.as_mut().poll(&mut cx);
                        if polled.is_ready() {
                            *slot = None;
                        }
                        polled
                    }
                    None => return,
                }
            };

            if let Poll::Ready(out) = polled {
                let joiner = {
                    let mut join = lock(&self.join);
                    join.output = Some(out);
                    join.waker.take()
                };
                self.state.store(DONE, Ordering::Release);
                if let Some(w) = joiner {
                    w.wake();
                }
                return;
            }

            match self.state.compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                // NOTIFIED: woken mid-poll, go again.
                Err(_) => self.state.store(RUNNING, Ordering::Release),
            }
        }
    }
}

impl<T: Send + 'static> Wake for Task<T> {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

/// Owns the result of a spawned task. Dropping it detaches the task.
pub struct JoinHandle<T> {
    task: Arc<Task<T>>,
}

impl<T: Send + 'static> JoinHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.task.state.load(Ordering::Acquire) == DONE
    }

    /// The output, if the task has finished and it was not taken yet.
    pub fn try_take(&self) -> Option<T> {
        lock(&self.task.join).output.take()
    }
}

impl<T: Send + 'static> Future for JoinHandle<T> {
    type Output = T;

    /// Panics if the output was already taken through `try_take`.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut join = lock(&self.task.join);
        if let Some(out) = join.output.take() {
            return Poll::Ready(out);
        }
        assert!(
            self.task.state.load(Ordering::Acquire) != DONE,
            "JoinHandle polled after its output was taken"
        );
        join.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Start `future` now, on this thread. It runs until its first pending
/// point before `spawn` returns.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let task = Arc::new(Task {
        state: AtomicU8::new(IDLE),
        future: Mutex::new(Some(Box::pin(future) as BoxFuture<F::Output>)),
        join: Mutex::new(JoinState { output: None, waker: None }),
    });
    task.schedule();
    JoinHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::service_or_skip;
    use std::sync::atomic::AtomicUsize;

    /// Pending until `send` is called, from any thread.
    #[derive(Clone, Default)]
    struct Oneshot(Arc<Mutex<(Option<u32>, Option<Waker>)>>);

    impl Oneshot {
        fn send(&self, v: u32) {
            let waker = {
                let mut inner = self.0.lock().unwrap();
                inner.0 = Some(v);
                inner.1.take()
            };
            if let Some(w) = waker {
                w.wake();
            }
        }
    }

    impl Future for Oneshot {
        type Output = u32;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u32> {
            let mut inner = self.0.lock().unwrap();
            match inner.0.take() {
                Some(v) => Poll::Ready(v),
                None => {
                    inner.1 = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }

    #[test]
    fn test_ready_future_finishes_inside_spawn() {
        let handle = spawn(async { 7 });
        assert!(handle.is_finished());
        assert_eq!(handle.try_take(), Some(7));
        assert_eq!(handle.try_take(), None);
    }

    #[test]
    fn test_wake_from_other_thread_runs_task_there() {
        let rx = Oneshot::default();
        let tx = rx.clone();
        let handle = spawn(async move { rx.await + 1 });
        assert!(!handle.is_finished());

        std::thread::spawn(move || tx.send(41)).join().unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.try_take(), Some(42));
    }

    #[test]
    fn test_self_wake_during_poll_repolls() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let handle = spawn(std::future::poll_fn(move |cx| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                cx.waker().wake_by_ref();
                Poll::Pending
            } else {
                Poll::Ready("done")
            }
        }));
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        assert_eq!(handle.try_take(), Some("done"));
    }

    #[test]
    fn test_task_chains_ops_while_service_runs() {
        let Some(service) = service_or_skip(4) else { return };
        let svc = service.clone();
        let handle = spawn(async move {
            let mut done = 0;
            for _ in 0..3 {
                svc.nop().await?;
                done += 1;
            }
            kring_core::Result::Ok(done)
        });
        assert!(!handle.is_finished());
        assert_eq!(service.pending(), 1);

        service.run().unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.try_take(), Some(Ok(3)));
    }

    #[test]
    fn test_block_on_join_handle() {
        let Some(service) = service_or_skip(2) else { return };
        let svc = service.clone();
        let handle = spawn(async move { svc.nop().await.map(|()| "joined") });
        let out = service.block_on(handle).unwrap();
        assert_eq!(out, Ok("joined"));
        assert!(service.idle());
    }
}
