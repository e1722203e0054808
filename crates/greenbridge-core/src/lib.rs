//! # greenbridge-core
//!
//! Core types for the greenbridge fiber bridge.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, context switching and the event loop live in `greenbridge-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber and connection state enums
//! - `error` - Error taxonomy for scheduling contract violations
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::{ConnState, FiberState};
pub use error::{FutureError, MemoryError, SchedError, SchedResult, SwitchError, WaitError};
pub use env::{
    env_get, env_get_bool, env_get_millis, env_get_opt, env_get_size, env_get_str, env_is_set,
};

/// Constants for fiber memory layout
pub mod constants {
    /// Default usable stack size per fiber (256 KB).
    ///
    /// Reserved with `MAP_NORESERVE`, so untouched pages cost nothing.
    pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

    /// Smallest stack a fiber may be given (16 KB, 4 pages)
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Number of guard pages below each fiber stack
    pub const GUARD_PAGES: usize = 1;

    /// Id of the root context (the thread's own stack, where the loop runs)
    pub const ROOT_FIBER_ID: u64 = 0;
}
