//! Single-threaded readiness event loop
//!
//! The loop runs on the root context and multiplexes three sources:
//!
//! - `call_soon` callbacks (FIFO, run on the next turn)
//! - one-shot timers ([`timer::TimerHeap`])
//! - one-shot fd readability, polled with `poll(2)`
//!
//! plus a wake descriptor for work posted from other threads through a
//! [`RemoteHandle`]. Every callback runs on the root context; callbacks
//! that resolve futures resume the waiting fiber inline.
//!
//! # Turn order
//!
//! ```text
//! ready queue -> remote queue -> expired timers -> poll -> readers -> expired timers
//! ```

pub mod notifier;
pub mod timer;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use greenbridge_core::error::{SchedError, SchedResult, SwitchError, WaitError};
use tracing::{debug, error, trace, warn};

use crate::fiber::{Fiber, Scheduler};
use crate::future::Future;

pub use notifier::{RemoteCompleter, RemoteHandle};
pub use timer::{TimerHandle, TimerStats};

use notifier::{RemoteMsg, RemoteShared};

/// Callback run on the loop thread
pub type Callback = Box<dyn FnOnce() + 'static>;

type RemoteSlot = Box<dyn FnOnce(Box<dyn Any + Send>)>;

/// Token for a pending reader or timer, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Registration {
    Reader { fd: RawFd, id: u64 },
    Timer(TimerHandle),
}

struct Reader {
    id: u64,
    fd: RawFd,
    callback: Callback,
}

struct LoopInner {
    sched: Scheduler,
    ready: RefCell<VecDeque<Callback>>,
    readers: RefCell<Vec<Reader>>,
    timers: RefCell<timer::TimerHeap>,
    remote: Arc<RemoteShared>,
    remote_slots: RefCell<HashMap<u64, RemoteSlot>>,
    next_id: Cell<u64>,
    stopped: Cell<bool>,
    running: Cell<bool>,
    poll_capacity: usize,
}

/// Handle to the loop; clones share the same loop
#[derive(Clone)]
pub struct EventLoop {
    inner: std::rc::Rc<LoopInner>,
}

impl EventLoop {
    /// Loop driving `sched`'s fibers from its root context
    pub fn new(sched: Scheduler) -> SchedResult<Self> {
        let config = sched.config().clone();
        let remote = Arc::new(RemoteShared::new()?);
        debug!(wake_fd = remote.wake_fd(), "event loop created");
        Ok(Self {
            inner: std::rc::Rc::new(LoopInner {
                sched,
                ready: RefCell::new(VecDeque::new()),
                readers: RefCell::new(Vec::new()),
                timers: RefCell::new(timer::TimerHeap::with_capacity(config.timer_capacity)),
                remote,
                remote_slots: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                stopped: Cell::new(false),
                running: Cell::new(false),
                poll_capacity: config.poll_capacity,
            }),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.sched
    }

    fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    /// Run `cb` on the next loop turn
    pub fn call_soon<F>(&self, cb: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.ready.borrow_mut().push_back(Box::new(cb));
    }

    /// Run `cb` once `fd` becomes readable (or hangs up / errors)
    pub fn on_readable<F>(&self, fd: RawFd, cb: F) -> Registration
    where
        F: FnOnce() + 'static,
    {
        let id = self.next_id();
        self.inner.readers.borrow_mut().push(Reader {
            id,
            fd,
            callback: Box::new(cb),
        });
        trace!(fd, id, "reader registered");
        Registration::Reader { fd, id }
    }

    /// Run `cb` after `delay`
    pub fn on_timer<F>(&self, delay: Duration, cb: F) -> Registration
    where
        F: FnOnce() + 'static,
    {
        let handle = self
            .inner
            .timers
            .borrow_mut()
            .insert(Instant::now() + delay, Box::new(cb));
        Registration::Timer(handle)
    }

    /// Future resolved when `fd` becomes readable
    pub fn readable(&self, fd: RawFd) -> (Future<()>, Registration) {
        let fut = Future::new();
        let f = fut.clone();
        let reg = self.on_readable(fd, move || resolve_logged(&f, ()));
        (fut, reg)
    }

    /// Future resolved after `delay`
    pub fn timer(&self, delay: Duration) -> (Future<()>, Registration) {
        let fut = Future::new();
        let f = fut.clone();
        let reg = self.on_timer(delay, move || resolve_logged(&f, ()));
        (fut, reg)
    }

    /// Park the current fiber for `delay`
    pub fn sleep(&self, delay: Duration) -> Result<(), WaitError> {
        let (fut, reg) = self.timer(delay);
        fut.blocking_wait(&self.inner.sched).inspect_err(|_| {
            self.cancel(reg);
        })
    }

    /// Drop a pending reader or timer; false if it already fired
    pub fn cancel(&self, reg: Registration) -> bool {
        match reg {
            Registration::Timer(handle) => self.inner.timers.borrow_mut().cancel(handle),
            Registration::Reader { id, .. } => {
                let removed = {
                    let mut readers = self.inner.readers.borrow_mut();
                    readers
                        .iter()
                        .position(|r| r.id == id)
                        .map(|pos| readers.remove(pos))
                };
                removed.is_some()
            }
        }
    }

    /// Drop every reader registered for `fd`; returns how many
    pub fn remove_readers(&self, fd: RawFd) -> usize {
        let removed: Vec<Reader> = {
            let mut readers = self.inner.readers.borrow_mut();
            let (gone, keep): (Vec<_>, Vec<_>) = readers.drain(..).partition(|r| r.fd == fd);
            *readers = keep;
            gone
        };
        if !removed.is_empty() {
            trace!(fd, count = removed.len(), "readers removed");
        }
        removed.len()
    }

    /// Spawn a fiber and switch into it on the next loop turn
    pub fn spawn<F>(&self, entry: F) -> SchedResult<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let fiber = self.inner.sched.spawn(entry)?;
        let (sched, f) = (self.inner.sched.clone(), fiber.clone());
        self.call_soon(move || {
            // Cancelled before its first turn
            if f.is_alive() {
                if let Err(err) = sched.switch_to(&f) {
                    error!(fiber = %f.id(), %err, "failed to start fiber");
                }
            }
        });
        Ok(fiber)
    }

    /// Thread-safe handle for posting work to this loop
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            shared: self.inner.remote.clone(),
        }
    }

    /// Future on this loop that another thread can complete
    pub fn remote_future<T>(&self) -> (Future<T>, RemoteCompleter<T>)
    where
        T: Send + 'static,
    {
        let id = self.next_id();
        let fut = Future::new();
        let f = fut.clone();
        self.inner.remote_slots.borrow_mut().insert(
            id,
            Box::new(move |value: Box<dyn Any + Send>| match value.downcast::<T>() {
                Ok(value) => resolve_logged(&f, *value),
                Err(_) => error!(id, "remote completion carried the wrong type"),
            }),
        );
        (fut, RemoteCompleter::new(id, self.inner.remote.clone()))
    }

    /// Make `run` / `run_until` return after the current turn
    pub fn stop(&self) {
        self.inner.stopped.set(true);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn timer_stats(&self) -> TimerStats {
        self.inner.timers.borrow().stats()
    }

    /// Run until `stop` is called or nothing is left that could fire
    pub fn run(&self) -> SchedResult<()> {
        self.enter()?;
        let res = self.run_turns();
        self.leave();
        res
    }

    fn run_turns(&self) -> SchedResult<()> {
        while !self.inner.stopped.get() {
            if !self.turn()? {
                debug!("event loop out of work");
                break;
            }
        }
        Ok(())
    }

    /// Run until `fut` resolves and return its value
    pub fn run_until<T: Clone + 'static>(&self, fut: &Future<T>) -> SchedResult<T> {
        self.enter()?;
        let res = self.turns_until(fut);
        self.leave();
        res
    }

    fn turns_until<T: Clone + 'static>(&self, fut: &Future<T>) -> SchedResult<T> {
        loop {
            if let Some(value) = fut.result() {
                return Ok(value);
            }
            if self.inner.stopped.get() {
                return Err(SchedError::Stopped);
            }
            if !self.turn()? {
                // The last turn may have resolved it before running dry
                return fut.result().ok_or(SchedError::Stalled);
            }
        }
    }

    fn enter(&self) -> SchedResult<()> {
        if !self.inner.sched.is_root() {
            let current = self.inner.sched.current_id();
            error!(fiber = %current, "event loop started from inside a fiber");
            return Err(SwitchError::NotRoot { current }.into());
        }
        self.inner.stopped.set(false);
        self.inner.running.set(true);
        Ok(())
    }

    fn leave(&self) {
        self.inner.running.set(false);
    }

    /// Anything that could still produce a callback
    fn has_work(&self) -> bool {
        let inner = &self.inner;
        !inner.ready.borrow().is_empty()
            || !inner.readers.borrow().is_empty()
            || !inner.timers.borrow().is_empty()
            || !inner.remote_slots.borrow().is_empty()
            || !inner.remote.is_empty()
            // Outstanding RemoteHandle clones may still post
            || Arc::strong_count(&inner.remote) > 1
    }

    /// One loop iteration; false when there was nothing left to wait for
    fn turn(&self) -> SchedResult<bool> {
        self.run_ready();
        self.run_remote();
        self.run_timers();
        if self.inner.stopped.get() {
            return Ok(true);
        }
        if !self.has_work() {
            return Ok(false);
        }

        let timeout = if !self.inner.ready.borrow().is_empty() || !self.inner.remote.is_empty() {
            Some(Duration::ZERO)
        } else {
            self.inner
                .timers
                .borrow_mut()
                .next_deadline()
                .map(|at| at.saturating_duration_since(Instant::now()))
        };

        let ready_fds = self.poll(timeout)?;
        self.run_readers(&ready_fds);
        self.run_timers();
        Ok(true)
    }

    fn run_ready(&self) {
        // Callbacks queued while draining wait for the next turn
        let batch: Vec<Callback> = self.inner.ready.borrow_mut().drain(..).collect();
        for cb in batch {
            cb();
        }
    }

    fn run_remote(&self) {
        for msg in self.inner.remote.drain() {
            match msg {
                RemoteMsg::Call(f) => f(self),
                RemoteMsg::Complete { id, value } => {
                    let slot = self.inner.remote_slots.borrow_mut().remove(&id);
                    match slot {
                        Some(slot) => slot(value),
                        None => warn!(id, "completion for unknown remote future"),
                    }
                }
                RemoteMsg::Abandon { id } => {
                    if self.inner.remote_slots.borrow_mut().remove(&id).is_some() {
                        debug!(id, "remote completer dropped without completing");
                    }
                }
            }
        }
    }

    fn run_timers(&self) {
        let expired = self.inner.timers.borrow_mut().pop_expired(Instant::now());
        for cb in expired {
            cb();
        }
    }

    fn run_readers(&self, ready: &HashSet<RawFd>) {
        if ready.is_empty() {
            return;
        }
        let fired: Vec<Reader> = {
            let mut readers = self.inner.readers.borrow_mut();
            let (fired, keep): (Vec<_>, Vec<_>) =
                readers.drain(..).partition(|r| ready.contains(&r.fd));
            *readers = keep;
            fired
        };
        for reader in fired {
            trace!(fd = reader.fd, id = reader.id, "reader fired");
            (reader.callback)();
        }
    }

    /// poll(2) over the wake fd and every fd with a pending reader
    fn poll(&self, timeout: Option<Duration>) -> SchedResult<HashSet<RawFd>> {
        let wake_fd = self.inner.remote.wake_fd();
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.inner.poll_capacity);
        fds.push(libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        {
            let mut seen = HashSet::new();
            for r in self.inner.readers.borrow().iter() {
                if seen.insert(r.fd) {
                    fds.push(libc::pollfd {
                        fd: r.fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                }
            }
        }

        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as libc::c_int
            }
        };

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(HashSet::new());
            }
            error!(%err, "poll failed");
            return Err(err.into());
        }

        let mask = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        Ok(fds
            .iter()
            .skip(1)
            .filter(|p| p.revents & mask != 0)
            .map(|p| p.fd)
            .collect())
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("ready", &self.inner.ready.borrow().len())
            .field("readers", &self.inner.readers.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .field("running", &self.inner.running.get())
            .finish()
    }
}

fn resolve_logged<T: 'static>(fut: &Future<T>, value: T) {
    if let Err(err) = fut.resolve(value) {
        error!(%err, "loop callback resolved a future twice");
    }
}
