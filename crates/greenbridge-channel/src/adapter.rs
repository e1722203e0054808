//! Channel adapter: client operations as futures
//!
//! Each method starts the operation and returns a future resolved from the
//! operation's own completion. A fiber blocks on it with
//! [`ChannelAdapter::wait`]; the loop keeps running other connections
//! meanwhile.

use std::rc::Rc;

use greenbridge_core::error::SchedResult;
use greenbridge_runtime::{EventLoop, Fiber, Future};
use tracing::{debug, error, warn};

use crate::client::{Message, PubSubClient, PubSubConnection, Reply, Subscriber};
use crate::error::ChannelResult;
use crate::inbox::{self, Inbox};

/// Connection handle returned by [`ChannelAdapter::connect`]
pub type Connection = Rc<dyn PubSubConnection>;

/// Subscription handle returned by [`ChannelAdapter::subscribe`]
pub type Subscription = Rc<dyn Subscriber>;

/// Future of a channel operation
pub type ChannelFuture<T> = Future<ChannelResult<T>>;

#[derive(Clone)]
pub struct ChannelAdapter {
    event_loop: EventLoop,
    client: Rc<dyn PubSubClient>,
}

impl ChannelAdapter {
    pub fn new(event_loop: EventLoop, client: Rc<dyn PubSubClient>) -> Self {
        Self { event_loop, client }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn connect(&self) -> ChannelFuture<Connection> {
        let fut = Future::new();
        self.client.connect(completer(&fut, "connect"));
        fut
    }

    pub fn subscribe(&self, conn: &Connection, channels: &[&str]) -> ChannelFuture<Subscription> {
        let fut = Future::new();
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        debug!(?channels, "subscribing");
        conn.subscribe(&channels, completer(&fut, "subscribe"));
        fut
    }

    pub fn publish(&self, conn: &Connection, channel: &str, message: &str) -> ChannelFuture<u64> {
        let fut = Future::new();
        conn.publish(channel, message, completer(&fut, "publish"));
        fut
    }

    /// Publish without waiting; failures are logged
    pub fn publish_detached(&self, conn: &Connection, channel: &str, message: &str) {
        let channel_name = channel.to_string();
        self.publish(conn, channel, message).add_done_callback(move |f| {
            if let Some(Err(err)) = f.result() {
                warn!(channel = %channel_name, %err, "publish failed");
            }
        });
    }

    pub fn receive_next(&self, sub: &Subscription) -> ChannelFuture<Message> {
        let fut = Future::new();
        sub.next_published(completer(&fut, "receive"));
        fut
    }

    /// Block the current fiber on a channel future
    pub fn wait<T: Clone + 'static>(&self, fut: &ChannelFuture<T>) -> ChannelResult<T> {
        fut.blocking_wait(self.event_loop.scheduler())?
    }

    /// Start a receiver fiber feeding an [`Inbox`] bound to `owner`
    pub fn listen(&self, sub: Subscription, owner: &Fiber) -> SchedResult<Inbox> {
        inbox::start(self, sub, owner)
    }
}

/// Reply that resolves `fut`, unless its waiter is already gone
fn completer<T: Clone + 'static>(fut: &ChannelFuture<T>, op: &'static str) -> Reply<T> {
    let fut = fut.clone();
    Box::new(move |result| {
        if fut.is_orphaned() {
            warn!(op, "dropping completion for a finished fiber");
            return;
        }
        if let Err(err) = fut.resolve(result) {
            error!(op, %err, "client completed an operation twice");
        }
    })
}

impl std::fmt::Debug for ChannelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAdapter")
            .field("event_loop", &self.event_loop)
            .finish()
    }
}
