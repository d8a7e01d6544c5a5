//! `InlineExecutor`: runs work on the calling thread, immediately.
//!
//! Submissions therefore reach the kernel inside the first poll of the
//! awaiting future, and resumptions run inside `run_one()`. All inline
//! executors are interchangeable, so they all compare equal.

use kring_core::executor::Executor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    #[inline]
    fn execute<W>(&self, work: W)
    where
        W: FnOnce() + Send + 'static,
    {
        work()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_before_returning() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        InlineExecutor.execute(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_runs_on_calling_thread() {
        let caller = std::thread::current().id();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let s = Arc::clone(&seen);
        InlineExecutor::default().execute(move || {
            *s.lock().unwrap() = Some(std::thread::current().id());
        });
        assert_eq!(*seen.lock().unwrap(), Some(caller));
    }

    #[test]
    fn test_all_instances_equal() {
        let a = InlineExecutor;
        let b = a;
        assert_eq!(a, b);
        assert_eq!(a, InlineExecutor::default());
    }
}
