//! Runtime configuration
//!
//! Library defaults with environment overrides, highest wins:
//!
//! 1. Builder calls in code
//! 2. Environment variables (`GB_*`)
//! 3. Library defaults
//!
//! ```rust,ignore
//! use greenbridge_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env().stack_size(128 * 1024);
//! ```

use greenbridge_core::constants::MIN_STACK_SIZE;
use greenbridge_core::env::{env_get, env_get_size};

/// Library defaults
pub mod defaults {
    use greenbridge_core::constants::DEFAULT_STACK_SIZE;

    pub const STACK_SIZE: usize = DEFAULT_STACK_SIZE;
    pub const POLL_CAPACITY: usize = 64;
    pub const TIMER_CAPACITY: usize = 256;
}

/// Scheduler and event loop configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Usable stack bytes per fiber
    pub stack_size: usize,
    /// Initial capacity of the pollfd array
    pub poll_capacity: usize,
    /// Initial capacity of the timer heap
    pub timer_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            poll_capacity: defaults::POLL_CAPACITY,
            timer_capacity: defaults::TIMER_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `GB_STACK_SIZE`, `GB_POLL_CAPACITY`,
    /// `GB_TIMER_CAPACITY`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stack_size: env_get_size("GB_STACK_SIZE", d.stack_size).max(MIN_STACK_SIZE),
            poll_capacity: env_get("GB_POLL_CAPACITY", d.poll_capacity),
            timer_capacity: env_get("GB_TIMER_CAPACITY", d.timer_capacity),
        }
    }

    /// Set the per-fiber stack size (clamped to the minimum)
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes.max(MIN_STACK_SIZE);
        self
    }

    pub fn poll_capacity(mut self, n: usize) -> Self {
        self.poll_capacity = n;
        self
    }

    pub fn timer_capacity(mut self, n: usize) -> Self {
        self.timer_capacity = n;
        self
    }
}
