//! Fiber and connection state types

use core::fmt;

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Spawned, never switched into
    Created = 0,

    /// Currently executing (exactly one per scheduler)
    Running = 1,

    /// Switched away explicitly via `switch_to`
    Suspended = 2,

    /// Parked inside a future wait
    Waiting = 3,

    /// Body returned, panicked, or was cancelled before it started
    Dead = 4,
}

impl FiberState {
    /// Check if control may be transferred into a fiber in this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(
            self,
            FiberState::Created | FiberState::Suspended | FiberState::Waiting
        )
    }

    /// Check if the fiber has terminated
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Dead)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Created,
            1 => FiberState::Running,
            2 => FiberState::Suspended,
            3 => FiberState::Waiting,
            _ => FiberState::Dead,
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Created => write!(f, "created"),
            FiberState::Running => write!(f, "running"),
            FiberState::Suspended => write!(f, "suspended"),
            FiberState::Waiting => write!(f, "waiting"),
            FiberState::Dead => write!(f, "dead"),
        }
    }
}

/// Lifecycle of a duplex connection fiber
///
/// ```text
/// Started -> AwaitingSetup -> Running <-> AwaitingEvent
///                 |              |            |
///                 +--------------+------------+--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Fiber spawned for the connection
    Started,

    /// Waiting for the pub/sub connect/subscribe futures
    AwaitingSetup,

    /// Processing events
    Running,

    /// Parked on the next event (message, readability, keep-alive)
    AwaitingEvent,

    /// Terminal: handshake failure, peer disconnect, or explicit close
    Closed,
}

impl ConnState {
    /// Check whether moving to `next` is a legal transition
    pub const fn can_transition_to(&self, next: ConnState) -> bool {
        use ConnState::*;
        match (*self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Started, AwaitingSetup) => true,
            (AwaitingSetup, Running) => true,
            (Running, AwaitingEvent) => true,
            (AwaitingEvent, Running) => true,
            _ => false,
        }
    }

    /// Check if this is the terminal state
    #[inline]
    pub const fn is_closed(&self) -> bool {
        matches!(self, ConnState::Closed)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Started => write!(f, "STARTED"),
            ConnState::AwaitingSetup => write!(f, "AWAITING_SETUP"),
            ConnState::Running => write!(f, "RUNNING"),
            ConnState::AwaitingEvent => write!(f, "AWAITING_EVENT"),
            ConnState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_state_predicates() {
        assert!(FiberState::Created.is_resumable());
        assert!(FiberState::Suspended.is_resumable());
        assert!(FiberState::Waiting.is_resumable());
        assert!(!FiberState::Running.is_resumable());
        assert!(!FiberState::Dead.is_resumable());

        assert!(FiberState::Dead.is_terminated());
        assert!(!FiberState::Waiting.is_terminated());
    }

    #[test]
    fn test_fiber_state_from_u8() {
        assert_eq!(FiberState::from(0), FiberState::Created);
        assert_eq!(FiberState::from(3), FiberState::Waiting);
        assert_eq!(FiberState::from(99), FiberState::Dead);
    }

    #[test]
    fn test_conn_state_transitions() {
        use ConnState::*;
        assert!(Started.can_transition_to(AwaitingSetup));
        assert!(AwaitingSetup.can_transition_to(Running));
        assert!(Running.can_transition_to(AwaitingEvent));
        assert!(AwaitingEvent.can_transition_to(Running));
        assert!(AwaitingSetup.can_transition_to(Closed));
        assert!(AwaitingEvent.can_transition_to(Closed));

        assert!(!Started.can_transition_to(Running));
        assert!(!Closed.can_transition_to(Running));
        assert!(!Closed.can_transition_to(Closed));
    }
}
