//! One-shot futures bridged onto fibers
//!
//! A [`Future`] is resolved exactly once, always on the loop thread. Code
//! running in a fiber can block on it with [`Future::blocking_wait`], which
//! parks the fiber and hands control back to its parent (normally the
//! event loop). Resolution resumes the fiber right away, inside the
//! resolver's call stack, after every callback registered before it.
//!
//! ```ignore
//! let (ready, _reg) = event_loop.readable(fd);
//! ready.blocking_wait(&sched)?;
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use greenbridge_core::error::{FutureError, WaitError};
use tracing::error;

use crate::fiber::{Fiber, Scheduler, WaitTicket, WeakFiber};

/// Callback run when a future resolves
pub type DoneCallback<T> = Box<dyn FnOnce(&Future<T>) + 'static>;

enum Pending<T> {
    User(DoneCallback<T>),
    Wake(WaitTicket),
}

struct FutureInner<T> {
    value: RefCell<Option<T>>,
    done: Cell<bool>,
    callbacks: RefCell<Vec<Pending<T>>>,
    owner: RefCell<WeakFiber>,
}

/// Single-assignment result slot
pub struct Future<T> {
    inner: Rc<FutureInner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Future<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(FutureInner {
                value: RefCell::new(None),
                done: Cell::new(false),
                callbacks: RefCell::new(Vec::new()),
                owner: RefCell::new(WeakFiber::default()),
            }),
        }
    }

    /// A future that is already resolved
    pub fn ready(value: T) -> Self {
        let fut = Self::new();
        *fut.inner.value.borrow_mut() = Some(value);
        fut.inner.done.set(true);
        fut
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.inner.done.get()
    }

    /// Store `value` and run the done-callbacks in registration order
    ///
    /// Fails without side effects if the future is already resolved.
    pub fn resolve(&self, value: T) -> Result<(), FutureError> {
        if self.inner.done.get() {
            error!("resolve called on an already resolved future");
            return Err(FutureError::AlreadyResolved);
        }
        *self.inner.value.borrow_mut() = Some(value);
        self.inner.done.set(true);

        // Taken first: callbacks may register more (those run immediately)
        let pending = std::mem::take(&mut *self.inner.callbacks.borrow_mut());
        for entry in pending {
            match entry {
                Pending::User(cb) => cb(self),
                Pending::Wake(ticket) => ticket.wake(),
            }
        }
        Ok(())
    }

    /// Run `cb` on resolution, or right now if already resolved
    pub fn add_done_callback<F>(&self, cb: F)
    where
        F: FnOnce(&Future<T>) + 'static,
    {
        if self.is_done() {
            cb(self);
        } else {
            self.inner.callbacks.borrow_mut().push(Pending::User(Box::new(cb)));
        }
    }

    /// The fiber that last blocked on this future, if still around
    pub fn owner(&self) -> Option<Fiber> {
        self.inner.owner.borrow().upgrade()
    }

    /// Bind the future to a fiber ahead of any wait
    pub fn set_owner(&self, fiber: &Fiber) {
        *self.inner.owner.borrow_mut() = fiber.downgrade();
    }

    /// True if the owning fiber has finished; resolving is then pointless
    pub fn is_orphaned(&self) -> bool {
        let owner = self.inner.owner.borrow();
        owner.upgrade().is_some_and(|f| !f.is_alive())
    }

    /// Register the single wake entry for this future
    ///
    /// Replaces an earlier wake entry so repeated waits on a long-pending
    /// future do not pile up tickets.
    fn register_wake(&self, ticket: &WaitTicket) {
        *self.inner.owner.borrow_mut() = ticket.fiber();
        let mut callbacks = self.inner.callbacks.borrow_mut();
        callbacks.retain(|p| !matches!(p, Pending::Wake(_)));
        callbacks.push(Pending::Wake(ticket.clone()));
    }

    fn callback_count(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }
}

impl<T: Clone + 'static> Future<T> {
    /// Clone of the value, if resolved
    pub fn result(&self) -> Option<T> {
        self.inner.value.borrow().clone()
    }

    /// Park the calling fiber until the future resolves
    ///
    /// Returns immediately if already resolved. Being switched back to
    /// early (by an unrelated `switch_to`) just parks again. Fails with
    /// `NotInFiber` from the root context and `Cancelled` once the fiber
    /// has been cancelled.
    pub fn blocking_wait(&self, sched: &Scheduler) -> Result<T, WaitError> {
        loop {
            if let Some(value) = self.result() {
                return Ok(value);
            }
            let ticket = sched.begin_wait()?;
            self.register_wake(&ticket);
            sched.park()?;
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("done", &self.inner.done.get())
            .field("callbacks", &self.inner.callbacks.borrow().len())
            .finish()
    }
}

/// Anything [`wait_any`] can park on
pub trait Waitable {
    fn is_done(&self) -> bool;

    #[doc(hidden)]
    fn register_wake(&self, ticket: &WaitTicket);
}

impl<T: 'static> Waitable for Future<T> {
    fn is_done(&self) -> bool {
        Future::is_done(self)
    }

    fn register_wake(&self, ticket: &WaitTicket) {
        Future::register_wake(self, ticket)
    }
}

/// Park until at least one of `futures` resolves
///
/// Returns the indices of every resolved future, in slice order. Several
/// can be ready at once; callers should check each of them.
pub fn wait_any(sched: &Scheduler, futures: &[&dyn Waitable]) -> Result<Vec<usize>, WaitError> {
    if futures.is_empty() {
        return Ok(Vec::new());
    }
    loop {
        let ready: Vec<usize> = futures
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_done())
            .map(|(i, _)| i)
            .collect();
        if !ready.is_empty() {
            return Ok(ready);
        }
        let ticket = sched.begin_wait()?;
        for fut in futures {
            fut.register_wake(&ticket);
        }
        sched.park()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use greenbridge_core::FiberState;

    fn sched() -> Scheduler {
        Scheduler::new(RuntimeConfig::default().stack_size(64 * 1024))
    }

    #[test]
    fn test_resolve_once() {
        let fut = Future::new();
        assert!(!fut.is_done());
        fut.resolve(5u32).unwrap();
        assert_eq!(fut.result(), Some(5));
        assert_eq!(fut.resolve(6), Err(FutureError::AlreadyResolved));
        assert_eq!(fut.result(), Some(5));
    }

    #[test]
    fn test_callbacks_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let fut: Future<&'static str> = Future::new();
        for n in 0..3 {
            let l = log.clone();
            fut.add_done_callback(move |f| l.borrow_mut().push((n, f.result())));
        }
        fut.resolve("x").unwrap();
        assert_eq!(*log.borrow(), vec![(0, Some("x")), (1, Some("x")), (2, Some("x"))]);

        // Late registration runs immediately
        let l = log.clone();
        fut.add_done_callback(move |_| l.borrow_mut().push((9, None)));
        assert_eq!(log.borrow().last(), Some(&(9, None)));
    }

    #[test]
    fn test_callback_may_register_another() {
        let hits = Rc::new(Cell::new(0));
        let fut = Future::new();
        let h = hits.clone();
        fut.add_done_callback(move |f: &Future<()>| {
            let h2 = h.clone();
            f.add_done_callback(move |_| h2.set(h2.get() + 10));
            h.set(h.get() + 1);
        });
        fut.resolve(()).unwrap();
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn test_blocking_wait_from_root_fails() {
        let s = sched();
        let fut: Future<u8> = Future::new();
        assert_eq!(fut.blocking_wait(&s), Err(WaitError::NotInFiber));

        // Already-resolved futures never need to park
        assert_eq!(Future::ready(3u8).blocking_wait(&s), Ok(3));
    }

    #[test]
    fn test_blocking_wait_resumes_inside_resolve() {
        let s = sched();
        let fut: Future<String> = Future::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (s2, f2, l2) = (s.clone(), fut.clone(), log.clone());
        let fiber = s
            .spawn(move || {
                l2.borrow_mut().push("waiting".to_string());
                let v = f2.blocking_wait(&s2).unwrap();
                l2.borrow_mut().push(format!("got {v}"));
            })
            .unwrap();

        s.switch_to(&fiber).unwrap();
        assert_eq!(fiber.state(), FiberState::Waiting);
        assert_eq!(fut.owner().map(|f| f.id()), Some(fiber.id()));

        let l = log.clone();
        fut.add_done_callback(move |_| l.borrow_mut().push("late callback".to_string()));

        fut.resolve("hi".to_string()).unwrap();
        log.borrow_mut().push("resolver returned".to_string());
        assert_eq!(
            *log.borrow(),
            ["waiting", "got hi", "late callback", "resolver returned"]
        );
        assert!(fut.is_orphaned());
    }

    #[test]
    fn test_spurious_resume_parks_again() {
        let s = sched();
        let fut: Future<u8> = Future::new();
        let (s2, f2) = (s.clone(), fut.clone());
        let fiber = s.spawn(move || assert_eq!(f2.blocking_wait(&s2), Ok(1))).unwrap();

        s.switch_to(&fiber).unwrap();
        // Unrelated switch into the waiting fiber
        s.switch_to(&fiber).unwrap();
        assert_eq!(fiber.state(), FiberState::Waiting);
        // Only one wake entry despite two parks
        assert_eq!(fut.callback_count(), 1);

        fut.resolve(1).unwrap();
        assert!(!fiber.is_alive());
    }

    #[test]
    fn test_cancel_parked_fiber() {
        let s = sched();
        let fut: Future<u8> = Future::new();
        let outcome = Rc::new(RefCell::new(None));
        let (s2, f2, o2) = (s.clone(), fut.clone(), outcome.clone());
        let fiber = s
            .spawn(move || *o2.borrow_mut() = Some(f2.blocking_wait(&s2)))
            .unwrap();

        s.switch_to(&fiber).unwrap();
        s.cancel(&fiber).unwrap();
        assert_eq!(*outcome.borrow(), Some(Err(WaitError::Cancelled)));
        assert!(!fiber.is_alive());

        // Resolving later must not touch the dead fiber
        fut.resolve(1).unwrap();
    }

    #[test]
    fn test_wait_any_reports_every_ready_index() {
        let s = sched();
        let a: Future<u8> = Future::new();
        let b: Future<&'static str> = Future::new();
        let c: Future<()> = Future::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let (s2, a2, b2, c2, seen2) = (s.clone(), a.clone(), b.clone(), c.clone(), seen.clone());
        let fiber = s
            .spawn(move || {
                seen2.borrow_mut().push(wait_any(&s2, &[&a2, &b2, &c2]).unwrap());
                s2.switch_to_parent().unwrap();
                seen2.borrow_mut().push(wait_any(&s2, &[&b2, &c2]).unwrap());
            })
            .unwrap();

        s.switch_to(&fiber).unwrap();
        a.resolve(1).unwrap();
        assert_eq!(fiber.state(), FiberState::Suspended);

        // Not waiting right now: these wakeups are dropped
        b.resolve("b").unwrap();
        c.resolve(()).unwrap();

        s.switch_to(&fiber).unwrap();
        assert_eq!(*seen.borrow(), vec![vec![0], vec![0, 1]]);
        assert!(!fiber.is_alive());
    }

    #[test]
    fn test_wait_any_stale_tickets_are_ignored() {
        let s = sched();
        let a: Future<u8> = Future::new();
        let b: Future<u8> = Future::new();
        let rounds = Rc::new(Cell::new(0));

        let (s2, a2, b2, r2) = (s.clone(), a.clone(), b.clone(), rounds.clone());
        let fiber = s
            .spawn(move || {
                let ready = wait_any(&s2, &[&a2, &b2]).unwrap();
                assert_eq!(ready, vec![0]);
                r2.set(1);
                // Park on something else; b's old ticket must not wake us
                let c: Future<u8> = Future::new();
                let _ = c.blocking_wait(&s2);
                r2.set(2);
            })
            .unwrap();

        s.switch_to(&fiber).unwrap();
        a.resolve(1).unwrap();
        assert_eq!(rounds.get(), 1);
        b.resolve(2).unwrap();
        assert_eq!(rounds.get(), 1);
        assert_eq!(fiber.state(), FiberState::Waiting);
        s.cancel(&fiber).unwrap();
        assert_eq!(rounds.get(), 2);
    }
}
