//! # greenbridge
//!
//! Lets blocking-style handler code run on a single-threaded readiness
//! event loop. Each connection gets a stackful fiber; when it needs a
//! result that arrives later (a channel message, socket readability, a
//! timer) it parks on a one-shot [`Future`] and the loop resumes it when
//! that future resolves.
//!
//! ## Quick Start
//!
//! ```ignore
//! use greenbridge::{serve_chat, ChatConfig, RuntimeConfig};
//!
//! fn main() -> Result<(), greenbridge::ServeError> {
//!     greenbridge::logging::init();
//!     serve_chat(ChatConfig::from_env(), RuntimeConfig::from_env())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Handlers (Handler / Session, one fiber each)     │
//! │         blocking_wait(), wait_any(), ChannelAdapter         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Scheduler + Future                         │
//! │      explicit switch_to, park/wake tickets, cancellation    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EventLoop                             │
//! │    call_soon queue, timer heap, poll(2) readers, remote     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::io;
use std::rc::Rc;

use thiserror::Error;
use tracing::info;

pub use greenbridge_core::{
    env_get, env_get_bool, env_get_opt, env_get_str, env_is_set, ConnState, FiberId, FiberState,
    FutureError, MemoryError, SchedError, SchedResult, SwitchError, WaitError,
};

pub use greenbridge_runtime::{
    logging, wait_any, EventLoop, Fiber, Future, Registration, RemoteCompleter, RemoteHandle,
    RuntimeConfig, Scheduler, Waitable, WeakFiber,
};

pub use greenbridge_channel::{
    ChannelAdapter, ChannelError, ChannelFuture, Inbox, LoopbackBroker, Message, PubSubClient,
    PubSubConnection, Subscriber,
};

pub use greenbridge_web::{
    ChatApp, ChatConfig, ConnContext, DriverError, Handler, Reply, Request, Response, Server,
    Session,
};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("scheduler: {0}")]
    Sched(#[from] SchedError),

    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}

/// Run the chat application on this thread until the loop stops
///
/// Uses the in-process broker for the pub/sub channel.
pub fn serve_chat(chat: ChatConfig, runtime: RuntimeConfig) -> Result<(), ServeError> {
    let event_loop = EventLoop::new(Scheduler::new(runtime))?;
    let broker = LoopbackBroker::new(event_loop.clone());
    let adapter = ChannelAdapter::new(event_loop.clone(), Rc::new(broker));

    let addr = chat.addr();
    let secure = chat.secure;
    let app = ChatApp::new(chat, adapter);
    let server = Server::bind(event_loop.clone(), addr.as_str(), Rc::new(app))
        .map_err(|source| ServeError::Bind { addr: addr.clone(), source })?
        .secure(secure);
    server.start()?;

    event_loop.run()?;
    let stats = server.stats();
    info!(accepted = stats.accepted, active = stats.active, "event loop finished");
    Ok(())
}
