//! External pub/sub client contract
//!
//! Every operation is asynchronous and reports through a [`Reply`]
//! callback, which implementations must invoke on the loop thread (from a
//! loop callback, never re-entrantly from inside the call itself).

use std::rc::Rc;

use crate::error::ChannelResult;

/// Completion callback for one client operation
pub type Reply<T> = Box<dyn FnOnce(ChannelResult<T>) + 'static>;

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub value: String,
}

impl Message {
    pub fn new(channel: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            value: value.into(),
        }
    }
}

/// Entry point: opens connections
pub trait PubSubClient {
    fn connect(&self, reply: Reply<Rc<dyn PubSubConnection>>);
}

/// One open connection
pub trait PubSubConnection {
    /// Switch the connection into subscriber mode on `channels`
    fn subscribe(&self, channels: &[String], reply: Reply<Rc<dyn Subscriber>>);

    /// Publish `message`; the reply carries the number of receivers
    fn publish(&self, channel: &str, message: &str, reply: Reply<u64>);
}

/// A subscribed connection
pub trait Subscriber {
    /// Complete with the next published message, in publish order
    fn next_published(&self, reply: Reply<Message>);
}
