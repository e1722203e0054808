//! # greenbridge-channel
//!
//! Bridges an asynchronous publish/subscribe client into fiber code.
//!
//! ```ignore
//! let adapter = ChannelAdapter::new(event_loop.clone(), Rc::new(broker));
//! // inside a fiber:
//! let conn = adapter.wait(&adapter.connect())?;
//! let sub = adapter.wait(&adapter.subscribe(&conn, &["foobar"]))?;
//! let inbox = adapter.listen(sub, &sched.current())?;
//! let msg = adapter.wait(&inbox.next())?;
//! ```
//!
//! ## Modules
//!
//! - `client` - the external client contract (callback based)
//! - `adapter` - client operations as futures
//! - `inbox` - owner-bound message buffer fed by a receiver fiber
//! - `loopback` - in-process backend
//! - `error` - `ChannelError`

pub mod adapter;
pub mod client;
pub mod error;
pub mod inbox;
pub mod loopback;

pub use adapter::{ChannelAdapter, ChannelFuture, Connection, Subscription};
pub use client::{Message, PubSubClient, PubSubConnection, Reply, Subscriber};
pub use error::{ChannelError, ChannelResult};
pub use inbox::Inbox;
pub use loopback::LoopbackBroker;
