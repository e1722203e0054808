//! Error types for the fiber scheduler and event loop
//!
//! Contract violations (`SwitchError`, `FutureError`) are reported as errors
//! at the call site and logged at `error` level by the runtime. They must be
//! propagated, never discarded.

use thiserror::Error;

use crate::id::FiberId;
use crate::state::FiberState;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler and loop operations
#[derive(Debug, Error)]
pub enum SchedError {
    /// Illegal control transfer
    #[error("switch error: {0}")]
    Switch(#[from] SwitchError),

    /// Illegal future transition
    #[error("future error: {0}")]
    Future(#[from] FutureError),

    /// A wait could not complete
    #[error("wait error: {0}")]
    Wait(#[from] WaitError),

    /// Stack allocation failed
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// The reactor's poll or notifier failed
    #[error("reactor I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `run_until` ran out of work before its future resolved
    #[error("event loop stalled with the awaited future still pending")]
    Stalled,

    /// `run_until` was interrupted by `stop`
    #[error("event loop stopped before the awaited future resolved")]
    Stopped,
}

/// Control-transfer contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    /// Target is running or dead
    #[error("fiber {id} is {state}, not suspended")]
    NotSuspended { id: FiberId, state: FiberState },

    /// Target belongs to a different scheduler
    #[error("fiber {id} belongs to another scheduler")]
    ForeignFiber { id: FiberId },

    /// `switch_to_parent` called from the root context
    #[error("the root context has no parent")]
    NoParent,

    /// Operation only allowed from the root context
    #[error("must be called from the root context, not fiber {current}")]
    NotRoot { current: FiberId },
}

/// Future contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FutureError {
    /// `resolve` called on a resolved future
    #[error("future already resolved")]
    AlreadyResolved,
}

/// Reasons a blocking wait returns without a value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// Blocking wait attempted from the root context
    #[error("blocking wait outside of a fiber")]
    NotInFiber,

    /// The waiting fiber was cancelled
    #[error("wait cancelled")]
    Cancelled,

    /// The suspend itself failed
    #[error("suspend failed: {0}")]
    Switch(#[from] SwitchError),
}

/// Stack memory errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// mmap failed
    #[error("stack allocation failed (errno {0})")]
    AllocationFailed(i32),

    /// mprotect failed
    #[error("stack protection change failed (errno {0})")]
    ProtectionFailed(i32),

    /// Requested size below the minimum
    #[error("stack size {0} below minimum")]
    InvalidSize(usize),
}
