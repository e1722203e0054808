//! # greenbridge-web
//!
//! HTTP/1.1 and WebSocket serving on greenbridge fibers: one fiber per
//! connection, reads parked on loop readiness, writes blocking.
//!
//! ## Modules
//!
//! - `http` - request parsing, response and chunk encoding
//! - `websocket` - handshake and RFC 6455 frame codec
//! - `conn` - socket wrapper and per-connection context
//! - `driver` - `Handler`/`Reply`/`Session`, runs one connection
//! - `server` - accept loop
//! - `chat` - the chat application (index page, trickle, pub/sub socket)
//! - `error` - `HttpError`, `WsError`, `DriverError`

pub mod chat;
pub mod conn;
pub mod driver;
pub mod error;
pub mod http;
pub mod server;
pub mod websocket;

pub use chat::{ChatApp, ChatConfig};
pub use conn::{ConnContext, Recv, Socket};
pub use driver::{serve, ChunkStream, Handler, Reply, Session};
pub use error::{DriverError, HttpError, WsError};
pub use http::{Request, Response, ResponseHead};
pub use server::{Server, ServerStats};
pub use websocket::{Frame, Opcode, Role};
