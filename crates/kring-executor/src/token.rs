//! `TokenSlab`: the completion slots behind every in-flight operation.
//!
//! A token is `generation << 32 | index`. The index addresses a slot that
//! never moves for the slab's lifetime, so the value the kernel echoes
//! back in `user_data` always resolves to the same slot no matter where
//! the awaiting future has been moved. The generation is bumped on every
//! release; a completion carrying an old generation is dropped instead of
//! resuming whoever reused the slot.
//!
//! ```text
//! Vacant ──acquire──▶ Armed(waker?) ──complete──▶ Done(result) ──release──▶ Vacant
//! ```
//!
//! Slot state sits behind a spinlock: the future and the drain loop each
//! hold it for a few instructions, and wakers are always invoked after it
//! is released.
//!
//! A slot is held from submission until the awaiting future has taken
//! its result, which can be well after the ring has drained it. The slab
//! therefore starts at the service's bandwidth and grows when every slot
//! is held; only `pending()` limits what may be submitted.

use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::task::{Poll, Waker};

use crossbeam_queue::SegQueue;
use kring_core::entry::Token;
use kring_core::error::Result;
use kring_core::{kdebug, kwarn, SpinLock};

enum SlotState {
    Vacant,
    Armed(Option<Waker>),
    Done(Result<u32>),
}

struct SlotInner {
    generation: u32,
    state: SlotState,
}

pub struct Slot {
    inner: SpinLock<SlotInner>,
}

impl Slot {
    fn vacant() -> Arc<Self> {
        Arc::new(Slot {
            inner: SpinLock::new(SlotInner { generation: 0, state: SlotState::Vacant }),
        })
    }
}

pub struct TokenSlab {
    slots: RwLock<Vec<Arc<Slot>>>,
    free: SegQueue<u32>,
}

impl TokenSlab {
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "token slab needs at least one slot");
        let slots: Vec<Arc<Slot>> = (0..capacity).map(|_| Slot::vacant()).collect();
        let free = SegQueue::new();
        for i in 0..capacity as u32 {
            free.push(i);
        }
        Self { slots: RwLock::new(slots), free }
    }

    fn slots(&self) -> RwLockReadGuard<'_, Vec<Arc<Slot>>> {
        self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Slots allocated so far, held or not.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    /// Slots not currently held by an operation.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a vacant slot and arm it, growing the slab if every slot is
    /// held.
    pub fn acquire(&self) -> Token {
        if let Some(index) = self.free.pop() {
            if let Some(slot) = self.slot(index) {
                return Self::arm(index, &slot);
            }
        }
        let slot = Slot::vacant();
        let index = {
            let mut slots = self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.push(Arc::clone(&slot));
            slots.len() - 1
        };
        kdebug!("token slab grown to {} slots", index + 1);
        Self::arm(index as u32, &slot)
    }

    fn arm(index: u32, slot: &Slot) -> Token {
        let mut inner = slot.inner.lock();
        inner.state = SlotState::Armed(None);
        Token::new(index, inner.generation)
    }

    fn slot(&self, index: u32) -> Option<Arc<Slot>> {
        self.slots().get(index as usize).cloned()
    }

    /// The slot `token` refers to, if the token is current.
    pub fn resolve(&self, token: Token) -> Option<Arc<Slot>> {
        let slot = self.slot(token.index())?;
        let inner = slot.inner.lock();
        let live = inner.generation == token.generation() && !matches!(inner.state, SlotState::Vacant);
        drop(inner);
        live.then_some(slot)
    }

    /// Take the result if it has arrived, otherwise remember `waker`.
    pub fn poll(&self, token: Token, waker: &Waker) -> Poll<Result<u32>> {
        let Some(slot) = self.slot(token.index()) else {
            return Poll::Pending;
        };
        let mut guard = slot.inner.lock();
        let inner = &mut *guard;
        if inner.generation != token.generation() {
            return Poll::Pending;
        }
        if let SlotState::Done(_) = inner.state {
            if let SlotState::Done(result) = std::mem::replace(&mut inner.state, SlotState::Armed(None)) {
                return Poll::Ready(result);
            }
        }
        if let SlotState::Armed(parked) = &mut inner.state {
            if !matches!(parked, Some(w) if w.will_wake(waker)) {
                *parked = Some(waker.clone());
            }
        }
        Poll::Pending
    }

    /// Deliver `result` to the slot. Returns the parked waker; the caller
    /// wakes it once no lock is held. Stale tokens are logged and dropped.
    pub fn complete(&self, token: Token, result: Result<u32>) -> Option<Waker> {
        let slot = self.slot(token.index())?;
        let mut inner = slot.inner.lock();
        if inner.generation != token.generation() {
            drop(inner);
            kwarn!("dropping completion for stale token {}", token);
            return None;
        }
        match std::mem::replace(&mut inner.state, SlotState::Done(result)) {
            SlotState::Armed(waker) => waker,
            prev => {
                // Not armed: put things back as they were.
                inner.state = prev;
                drop(inner);
                kwarn!("dropping completion for unarmed token {}", token);
                None
            }
        }
    }

    /// Forget the parked waker; the result will still be recorded.
    pub fn disarm(&self, token: Token) {
        if let Some(slot) = self.slot(token.index()) {
            let mut inner = slot.inner.lock();
            if inner.generation == token.generation() {
                if let SlotState::Armed(w) = &mut inner.state {
                    *w = None;
                }
            }
        }
    }

    pub fn is_done(&self, token: Token) -> bool {
        self.slot(token.index()).map_or(false, |slot| {
            let inner = slot.inner.lock();
            inner.generation == token.generation() && matches!(inner.state, SlotState::Done(_))
        })
    }

    /// Return the slot to the free list. Later completions for `token`
    /// are rejected as stale.
    pub fn release(&self, token: Token) {
        let Some(slot) = self.slot(token.index()) else {
            return;
        };
        {
            let mut inner = slot.inner.lock();
            if inner.generation != token.generation() || matches!(inner.state, SlotState::Vacant) {
                return;
            }
            inner.generation = inner.generation.wrapping_add(1);
            inner.state = SlotState::Vacant;
        }
        self.free.push(token.index());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kring_core::error::KringError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let c = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let w = Waker::from(Arc::clone(&c));
        (c, w)
    }

    #[test]
    fn test_acquire_reuses_released_slot() {
        let slab = TokenSlab::new(3);
        let tokens: Vec<Token> = (0..3).map(|_| slab.acquire()).collect();
        assert_eq!(slab.available(), 0);

        let mut indices: Vec<u32> = tokens.iter().map(|t| t.index()).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2]);

        slab.release(tokens[1]);
        assert_eq!(slab.available(), 1);
        let again = slab.acquire();
        assert_eq!(again.index(), tokens[1].index());
        assert_eq!(again.generation(), tokens[1].generation() + 1);
        assert_eq!(slab.capacity(), 3);
    }

    #[test]
    fn test_grows_when_every_slot_is_held() {
        let slab = TokenSlab::new(1);
        let (_, waker) = counting_waker();
        let first = slab.acquire();
        assert!(slab.complete(first, Ok(1)).is_none());

        // Completed but not yet taken: the slot is still held.
        let second = slab.acquire();
        assert_ne!(second.index(), first.index());
        assert_eq!(slab.capacity(), 2);

        assert_eq!(slab.poll(first, &waker), Poll::Ready(Ok(1)));
        slab.release(first);
        slab.release(second);
        assert_eq!(slab.available(), 2);
        assert_eq!(slab.acquire().index(), first.index());
    }

    #[test]
    fn test_echoed_value_resolves_to_same_slot() {
        let slab = TokenSlab::new(4);
        let a = slab.acquire();
        let b = slab.acquire();

        // What the kernel hands back is just the u64.
        let echoed = Token(a.0);
        let from_token = slab.resolve(a).unwrap();
        let from_echo = slab.resolve(echoed).unwrap();
        assert!(Arc::ptr_eq(&from_token, &from_echo));
        assert!(!Arc::ptr_eq(&from_token, &slab.resolve(b).unwrap()));
    }

    #[test]
    fn test_complete_before_poll() {
        let slab = TokenSlab::new(1);
        let (count, waker) = counting_waker();
        let t = slab.acquire();

        assert!(slab.complete(t, Ok(5)).is_none(), "no waker parked yet");
        assert!(slab.is_done(t));
        assert_eq!(slab.poll(t, &waker), Poll::Ready(Ok(5)));
        assert_eq!(count.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_poll_then_complete_returns_waker() {
        let slab = TokenSlab::new(1);
        let (count, waker) = counting_waker();
        let t = slab.acquire();

        assert_eq!(slab.poll(t, &waker), Poll::Pending);
        let parked = slab.complete(t, Err(KringError::Os(9))).unwrap();
        parked.wake();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert_eq!(slab.poll(t, &waker), Poll::Ready(Err(KringError::Os(9))));
    }

    #[test]
    fn test_stale_token_rejected() {
        let slab = TokenSlab::new(1);
        let old = slab.acquire();
        slab.release(old);
        let new = slab.acquire();
        assert_eq!(old.index(), new.index());

        assert!(slab.resolve(old).is_none());
        assert!(slab.complete(old, Ok(1)).is_none());
        assert!(!slab.is_done(new), "stale completion must not land in the new owner's slot");

        slab.release(old);
        assert_eq!(slab.available(), 0, "stale release must not free the slot");
    }

    #[test]
    fn test_disarm_drops_waker() {
        let slab = TokenSlab::new(1);
        let (count, waker) = counting_waker();
        let t = slab.acquire();
        assert_eq!(slab.poll(t, &waker), Poll::Pending);
        slab.disarm(t);
        assert!(slab.complete(t, Ok(0)).is_none());
        assert!(slab.is_done(t));
        assert_eq!(count.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_vacant_slot_ignores_completion() {
        let slab = TokenSlab::new(2);
        assert!(slab.complete(Token::new(1, 0), Ok(3)).is_none());
        assert!(slab.resolve(Token::new(1, 0)).is_none());
        assert!(slab.complete(Token::new(99, 0), Ok(3)).is_none());
        assert_eq!(slab.available(), 2);
    }
}
