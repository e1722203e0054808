//! Error types for connection handling

use std::io;

use greenbridge_channel::ChannelError;
use greenbridge_core::error::{SchedError, WaitError};
use thiserror::Error;

/// Request parsing failures
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request line")]
    BadRequestLine,

    #[error("malformed header line")]
    BadHeader,

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("request body of {0} bytes not accepted")]
    BodyTooLarge(usize),

    #[error("connection closed mid-request")]
    Incomplete,
}

/// WebSocket handshake and framing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WsError {
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    #[error("reserved bits set without extension")]
    ReservedBitsSet,

    #[error("client frame is not masked")]
    UnmaskedClientFrame,

    #[error("server frame is masked")]
    MaskedServerFrame,

    #[error("control frame is fragmented")]
    FragmentedControlFrame,

    #[error("control frame too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("continuation frame without a started message")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    InterleavedDataFrame,

    #[error("invalid UTF-8 in text frame")]
    InvalidUtf8,
}

impl WsError {
    /// Status code of the close frame sent before dropping the peer
    pub fn close_code(&self) -> u16 {
        match self {
            // 1009: message too big
            WsError::PayloadTooLarge { .. } => 1009,
            // 1007: invalid payload data
            WsError::InvalidUtf8 => 1007,
            // 1002: protocol error
            _ => 1002,
        }
    }
}

/// Anything that ends a connection fiber early
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("http: {0}")]
    Http(#[from] HttpError),

    #[error("websocket: {0}")]
    Ws(#[from] WsError),

    #[error("socket: {0}")]
    Io(#[from] io::Error),

    #[error("wait: {0}")]
    Wait(#[from] WaitError),

    #[error("channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("scheduler: {0}")]
    Sched(#[from] SchedError),

    /// Peer went away before sending anything
    #[error("peer closed the connection")]
    PeerClosed,
}

impl DriverError {
    /// Errors that are a normal end of a connection rather than a fault
    pub fn is_disconnect(&self) -> bool {
        match self {
            DriverError::PeerClosed => true,
            DriverError::Http(HttpError::Incomplete) => true,
            DriverError::Wait(WaitError::Cancelled) => true,
            DriverError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}
