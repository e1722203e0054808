//! Channel error type

use greenbridge_core::error::WaitError;
use thiserror::Error;

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Pub/sub failures
///
/// `Clone` because results travel inside `Future<ChannelResult<T>>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },

    /// Subscription or inbox shut down
    #[error("channel closed")]
    Closed,

    /// The fiber could not wait for the result
    #[error("wait failed: {0}")]
    Wait(#[from] WaitError),
}

impl ChannelError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}
