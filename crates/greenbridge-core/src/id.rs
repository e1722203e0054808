//! Fiber identifier type

use core::fmt;

use crate::constants::ROOT_FIBER_ID;

/// Unique identifier for a fiber within one scheduler
///
/// Ids are handed out sequentially by the scheduler and never reused.
/// Id 0 is reserved for the root context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// The root context (the thread stack that runs the event loop)
    pub const ROOT: FiberId = FiberId(ROOT_FIBER_ID);

    /// Create a new FiberId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the root context
    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == ROOT_FIBER_ID
    }
}

impl From<u64> for FiberId {
    #[inline]
    fn from(id: u64) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "FiberId(ROOT)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
