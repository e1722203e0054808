//! # greenbridge-runtime
//!
//! Platform-specific runtime for the greenbridge fiber bridge.
//!
//! Fibers are stackful coroutines with explicit control transfer. Each
//! thread that wants them creates one [`Scheduler`] and one [`EventLoop`];
//! the loop owns the thread's root context and resumes fibers when the
//! futures they block on resolve.
//!
//! ```ignore
//! use greenbridge_runtime::{EventLoop, RuntimeConfig, Scheduler};
//! use std::time::Duration;
//!
//! let sched = Scheduler::new(RuntimeConfig::from_env());
//! let event_loop = EventLoop::new(sched)?;
//! let lp = event_loop.clone();
//! event_loop.spawn(move || {
//!     lp.sleep(Duration::from_millis(10)).unwrap();
//! })?;
//! event_loop.run()?;
//! ```
//!
//! ## Modules
//!
//! - `arch` - context switch assembly (x86_64, aarch64)
//! - `memory` - mmap'd stacks with guard pages
//! - `fiber` - fibers and the scheduler
//! - `future` - one-shot futures and multi-wait
//! - `reactor` - poll(2) event loop, timers, cross-thread wakeups
//! - `config` - runtime configuration
//! - `logging` - tracing subscriber setup

pub mod arch;
pub mod config;
pub mod fiber;
pub mod future;
pub mod logging;
pub mod memory;
pub mod reactor;

pub use config::RuntimeConfig;
pub use fiber::{Fiber, Scheduler, WaitTicket, WeakFiber};
pub use future::{wait_any, DoneCallback, Future, Waitable};
pub use reactor::{Callback, EventLoop, Registration, RemoteCompleter, RemoteHandle, TimerStats};

pub use greenbridge_core::{
    ConnState, FiberId, FiberState, FutureError, SchedError, SchedResult, SwitchError, WaitError,
};
