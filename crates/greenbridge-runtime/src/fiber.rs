//! Stackful fibers and the explicit-transfer scheduler
//!
//! A [`Scheduler`] owns one thread's root context plus every fiber spawned
//! from it. Control only moves on explicit [`Scheduler::switch_to`] /
//! [`Scheduler::switch_to_parent`] calls; there is no run queue and no
//! preemption.
//!
//! # Parent chain
//!
//! `switch_to(target)` records the caller as `target`'s parent. When a
//! fiber suspends itself with `switch_to_parent`, or finishes, control goes
//! back to that parent. If the parent is gone the root context takes over.
//!
//! # Lifetime of a finished fiber
//!
//! A finished fiber is still executing on its own stack when it hands
//! control away, so it cannot free that stack itself. Its last strong
//! reference is parked in the scheduler's graveyard and released by
//! whichever context runs next.

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use greenbridge_core::error::{SchedResult, SwitchError, WaitError};
use greenbridge_core::{FiberId, FiberState};
use tracing::{debug, error, trace};

use crate::arch::{self, SavedRegs};
use crate::config::RuntimeConfig;
use crate::memory::FiberStack;

type Entry = Box<dyn FnOnce() + 'static>;
type PanicPayload = Box<dyn Any + Send + 'static>;

pub(crate) struct FiberInner {
    id: FiberId,
    state: Cell<FiberState>,
    parent: RefCell<Weak<FiberInner>>,
    regs: UnsafeCell<SavedRegs>,
    entry: Cell<Option<Entry>>,
    cancelled: Cell<bool>,
    /// Bumped on every park; stale wakeups carry an older value
    wait_seq: Cell<u64>,
    sched: Weak<SchedInner>,
    // Dropped last: nothing above may live on this stack
    stack: Option<FiberStack>,
}

impl FiberInner {
    fn state(&self) -> FiberState {
        self.state.get()
    }
}

pub(crate) struct SchedInner {
    root: Rc<FiberInner>,
    current: RefCell<Rc<FiberInner>>,
    next_id: Cell<u64>,
    config: RuntimeConfig,
    pending_panic: RefCell<Option<PanicPayload>>,
    graveyard: RefCell<Vec<Rc<FiberInner>>>,
}

/// Handle to a fiber
///
/// Cloning the handle does not clone the fiber. A suspended fiber keeps
/// itself alive from its own stack, so dropping every handle never frees a
/// stack that may still be resumed; a fiber that is never resumed again
/// keeps its stack mapped.
#[derive(Clone)]
pub struct Fiber {
    pub(crate) inner: Rc<FiberInner>,
}

impl Fiber {
    #[inline]
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.inner.state()
    }

    /// True until the fiber's entry function has returned (or it was
    /// cancelled before starting)
    #[inline]
    pub fn is_alive(&self) -> bool {
        !self.inner.state().is_terminated()
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.inner.id.is_root()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// The context control returns to when this fiber suspends or ends
    pub fn parent(&self) -> Option<Fiber> {
        self.inner.parent.borrow().upgrade().map(|inner| Fiber { inner })
    }

    pub fn downgrade(&self) -> WeakFiber {
        WeakFiber(Rc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &Fiber) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

/// Non-owning fiber reference
#[derive(Clone, Default)]
pub struct WeakFiber(pub(crate) Weak<FiberInner>);

impl WeakFiber {
    pub fn upgrade(&self) -> Option<Fiber> {
        self.0.upgrade().map(|inner| Fiber { inner })
    }

    /// False once the fiber has finished or every handle is gone
    pub fn is_alive(&self) -> bool {
        self.0
            .upgrade()
            .is_some_and(|f| !f.state().is_terminated())
    }
}

impl fmt::Debug for WeakFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(inner) => write!(f, "WeakFiber({})", inner.id),
            None => f.write_str("WeakFiber(gone)"),
        }
    }
}

/// Permission to resume one particular park of one fiber
///
/// Handed out when a fiber is about to park on something. Waking an old
/// ticket after the fiber has moved on is a logged no-op.
#[derive(Clone)]
pub struct WaitTicket {
    fiber: Weak<FiberInner>,
    seq: u64,
}

impl WaitTicket {
    pub(crate) fn fiber(&self) -> WeakFiber {
        WeakFiber(self.fiber.clone())
    }

    /// Resume the parked fiber if this ticket is still current
    pub fn wake(&self) {
        let Some(fiber) = self.fiber.upgrade() else {
            debug!("wakeup dropped: fiber no longer exists");
            return;
        };
        if fiber.state() != FiberState::Waiting || fiber.wait_seq.get() != self.seq {
            trace!(fiber = %fiber.id, "stale wakeup ignored");
            return;
        }
        let Some(sched) = fiber.sched.upgrade() else {
            debug!(fiber = %fiber.id, "wakeup dropped: scheduler gone");
            return;
        };
        let sched = Scheduler { inner: sched };
        if let Err(err) = sched.transfer(&fiber, true) {
            error!(fiber = %fiber.id, %err, "failed to resume waiting fiber");
        }
    }
}

impl fmt::Debug for WaitTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitTicket")
            .field("fiber", &self.fiber())
            .field("seq", &self.seq)
            .finish()
    }
}

/// Per-thread fiber scheduler
///
/// Cheap to clone; every clone drives the same set of fibers.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Rc<SchedInner>,
}

impl Scheduler {
    /// Scheduler whose root context is the calling thread's own stack
    pub fn new(config: RuntimeConfig) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<SchedInner>| {
            let root = Rc::new(FiberInner {
                id: FiberId::ROOT,
                state: Cell::new(FiberState::Running),
                parent: RefCell::new(Weak::new()),
                regs: UnsafeCell::new(SavedRegs::default()),
                entry: Cell::new(None),
                cancelled: Cell::new(false),
                wait_seq: Cell::new(0),
                sched: weak.clone(),
                stack: None,
            });
            SchedInner {
                current: RefCell::new(root.clone()),
                root,
                next_id: Cell::new(1),
                config,
                pending_panic: RefCell::new(None),
                graveyard: RefCell::new(Vec::new()),
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Create a fiber that runs `entry` when first switched to
    pub fn spawn<F>(&self, entry: F) -> SchedResult<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let stack = FiberStack::new(self.inner.config.stack_size)?;
        let top = stack.top();
        let id = FiberId::new(self.inner.next_id.get());
        self.inner.next_id.set(id.as_u64() + 1);

        let inner = Rc::new(FiberInner {
            id,
            state: Cell::new(FiberState::Created),
            parent: RefCell::new(Weak::new()),
            regs: UnsafeCell::new(SavedRegs::default()),
            entry: Cell::new(Some(Box::new(entry))),
            cancelled: Cell::new(false),
            wait_seq: Cell::new(0),
            sched: Rc::downgrade(&self.inner),
            stack: Some(stack),
        });

        // SAFETY: the stack is owned by `inner`, which `current` keeps alive
        // for as long as the context runs.
        unsafe {
            arch::init_context(inner.regs.get(), top, fiber_main, Rc::as_ptr(&inner) as usize);
        }
        trace!(fiber = %id, "spawned");
        Ok(Fiber { inner })
    }

    /// The context executing right now
    pub fn current(&self) -> Fiber {
        Fiber {
            inner: self.inner.current.borrow().clone(),
        }
    }

    pub fn current_id(&self) -> FiberId {
        self.inner.current.borrow().id
    }

    pub fn root(&self) -> Fiber {
        Fiber {
            inner: self.inner.root.clone(),
        }
    }

    /// True when called from the root context
    pub fn is_root(&self) -> bool {
        self.current_id().is_root()
    }

    /// Whether the current fiber has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.current.borrow().cancelled.get()
    }

    /// Suspend the caller and run `target`; the caller becomes its parent
    ///
    /// Returns once something switches back to the caller. A panic that
    /// escaped a fiber's entry function surfaces here, in the context the
    /// dead fiber returned to.
    pub fn switch_to(&self, target: &Fiber) -> Result<(), SwitchError> {
        self.transfer(&target.inner, true)
    }

    /// Suspend the caller and resume its parent (root if the parent is gone)
    pub fn switch_to_parent(&self) -> Result<(), SwitchError> {
        let parent = {
            let current = self.inner.current.borrow();
            if current.id.is_root() {
                error!("switch_to_parent called from the root context");
                return Err(SwitchError::NoParent);
            }
            let parent = current.parent.borrow().upgrade();
            parent
                .filter(|p| p.state().is_resumable())
                .unwrap_or_else(|| self.inner.root.clone())
        };
        self.transfer(&parent, false)
    }

    /// Cancel `fiber`
    ///
    /// - Created: it never runs; its entry is dropped.
    /// - Parked: it is resumed right now and its pending wait returns
    ///   `WaitError::Cancelled`.
    /// - Current: the flag is set; its next wait fails.
    /// - Dead: no-op.
    pub fn cancel(&self, fiber: &Fiber) -> Result<(), SwitchError> {
        let inner = &fiber.inner;
        if !self.owns(inner) {
            return Err(SwitchError::ForeignFiber { id: inner.id });
        }
        if inner.id.is_root() {
            return Err(SwitchError::NoParent);
        }
        inner.cancelled.set(true);
        match inner.state() {
            FiberState::Dead => Ok(()),
            FiberState::Running => {
                debug!(fiber = %inner.id, "cancellation requested by the fiber itself");
                Ok(())
            }
            FiberState::Created => {
                drop(inner.entry.take());
                inner.state.set(FiberState::Dead);
                debug!(fiber = %inner.id, "cancelled before start");
                Ok(())
            }
            FiberState::Suspended | FiberState::Waiting => {
                debug!(fiber = %inner.id, "cancelling parked fiber");
                self.transfer(inner, true)
            }
        }
    }

    /// Hand out a ticket for parking the current fiber
    pub(crate) fn begin_wait(&self) -> Result<WaitTicket, WaitError> {
        let current = self.inner.current.borrow();
        if current.id.is_root() {
            error!("blocking wait attempted from the root context");
            return Err(WaitError::NotInFiber);
        }
        if current.cancelled.get() {
            return Err(WaitError::Cancelled);
        }
        let seq = current.wait_seq.get() + 1;
        current.wait_seq.set(seq);
        Ok(WaitTicket {
            fiber: Rc::downgrade(&current),
            seq,
        })
    }

    /// Park the current fiber until its latest ticket is woken
    pub(crate) fn park(&self) -> Result<(), WaitError> {
        let current = self.inner.current.borrow().clone();
        current.state.set(FiberState::Waiting);
        if let Err(err) = self.switch_to_parent() {
            current.state.set(FiberState::Running);
            return Err(err.into());
        }
        if current.cancelled.get() {
            return Err(WaitError::Cancelled);
        }
        Ok(())
    }

    fn owns(&self, fiber: &FiberInner) -> bool {
        std::ptr::eq(fiber.sched.as_ptr(), Rc::as_ptr(&self.inner))
    }

    /// Move execution from the current context to `target`
    fn transfer(&self, target: &Rc<FiberInner>, reparent: bool) -> Result<(), SwitchError> {
        if !self.owns(target) {
            error!(fiber = %target.id, "switch to a fiber of another scheduler");
            return Err(SwitchError::ForeignFiber { id: target.id });
        }

        // Held across the switch: keeps our own context alive while parked
        let current = self.inner.current.borrow().clone();
        if Rc::ptr_eq(&current, target) {
            error!(fiber = %target.id, "switch to the running fiber");
            return Err(SwitchError::NotSuspended {
                id: target.id,
                state: FiberState::Running,
            });
        }
        let state = target.state();
        if !state.is_resumable() {
            error!(fiber = %target.id, %state, "switch to a fiber that cannot run");
            return Err(SwitchError::NotSuspended { id: target.id, state });
        }

        if reparent {
            *target.parent.borrow_mut() = Rc::downgrade(&current);
        }
        if current.state() == FiberState::Running {
            current.state.set(FiberState::Suspended);
        }
        target.state.set(FiberState::Running);
        *self.inner.current.borrow_mut() = target.clone();
        trace!(from = %current.id, to = %target.id, "switch");

        // SAFETY: both register files belong to live contexts; `current`
        // stays referenced by this frame until we are switched back in.
        unsafe { arch::switch_context(current.regs.get(), target.regs.get()) };

        self.reap();
        let payload = self.inner.pending_panic.borrow_mut().take();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    /// Free fibers that finished before we were resumed
    fn reap(&self) {
        let dead = std::mem::take(&mut *self.inner.graveyard.borrow_mut());
        for fiber in &dead {
            trace!(fiber = %fiber.id, "reaped");
        }
        drop(dead);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("current", &self.current_id())
            .field("next_id", &self.inner.next_id.get())
            .finish()
    }
}

/// First Rust frame on every fiber stack
extern "C" fn fiber_main(arg: usize) -> ! {
    let (old, new) = run_fiber(arg as *const FiberInner);
    // SAFETY: `run_fiber` returned register files of two live contexts and
    // left no destructors pending on this stack.
    unsafe { arch::switch_context(old, new) };
    // A dead fiber is never resumed
    std::process::abort()
}

/// Run the entry function, then pick the context to hand control to
fn run_fiber(ptr: *const FiberInner) -> (*mut SavedRegs, *const SavedRegs) {
    // SAFETY: `current` holds a strong reference while this context runs.
    let fiber = unsafe { &*ptr };
    let Some(sched) = fiber.sched.upgrade() else {
        error!(fiber = %fiber.id, "fiber started without a scheduler");
        std::process::abort();
    };

    if let Some(entry) = fiber.entry.take() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            error!(fiber = %fiber.id, "fiber panicked");
            *sched.pending_panic.borrow_mut() = Some(payload);
        }
    }
    fiber.state.set(FiberState::Dead);

    let target = fiber
        .parent
        .borrow()
        .upgrade()
        .filter(|p| p.state().is_resumable())
        .unwrap_or_else(|| sched.root.clone());
    target.state.set(FiberState::Running);
    let this = sched.current.replace(target.clone());
    trace!(fiber = %fiber.id, to = %target.id, "finished");

    let old = fiber.regs.get();
    let new = target.regs.get() as *const SavedRegs;
    sched.graveyard.borrow_mut().push(this);
    (old, new)
}
