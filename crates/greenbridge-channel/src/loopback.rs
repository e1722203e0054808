//! In-process pub/sub backend
//!
//! Completes every operation through `call_soon`, so replies always arrive
//! on a later loop turn, the way a networked client would behave. Messages
//! are delivered to every live subscriber of a channel in publish order.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use greenbridge_runtime::EventLoop;
use tracing::{debug, trace};

use crate::client::{Message, PubSubClient, PubSubConnection, Reply, Subscriber};
use crate::error::ChannelError;

struct BrokerInner {
    event_loop: EventLoop,
    channels: RefCell<HashMap<String, Vec<Weak<SubscriberInner>>>>,
    published: Cell<u64>,
    refuse_connections: Cell<bool>,
    connections: Cell<u64>,
}

/// Loopback [`PubSubClient`]
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Rc<BrokerInner>,
}

impl LoopbackBroker {
    pub fn new(event_loop: EventLoop) -> Self {
        Self {
            inner: Rc::new(BrokerInner {
                event_loop,
                channels: RefCell::new(HashMap::new()),
                published: Cell::new(0),
                refuse_connections: Cell::new(false),
                connections: Cell::new(0),
            }),
        }
    }

    /// Make subsequent `connect` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.set(refuse);
    }

    /// Number of messages published so far
    pub fn published(&self) -> u64 {
        self.inner.published.get()
    }

    pub fn connections(&self) -> u64 {
        self.inner.connections.get()
    }

    /// Live subscribers of `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .borrow()
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| s.strong_count() > 0).count())
    }
}

impl PubSubClient for LoopbackBroker {
    fn connect(&self, reply: Reply<Rc<dyn PubSubConnection>>) {
        let broker = self.inner.clone();
        self.inner.event_loop.call_soon(move || {
            if broker.refuse_connections.get() {
                reply(Err(ChannelError::Connect("connection refused".into())));
                return;
            }
            let id = broker.connections.get() + 1;
            broker.connections.set(id);
            debug!(conn = id, "loopback connection opened");
            reply(Ok(Rc::new(LoopbackConnection { broker, id })));
        });
    }
}

struct LoopbackConnection {
    broker: Rc<BrokerInner>,
    id: u64,
}

impl PubSubConnection for LoopbackConnection {
    fn subscribe(&self, channels: &[String], reply: Reply<Rc<dyn Subscriber>>) {
        let broker = self.broker.clone();
        let channels = channels.to_vec();
        let conn = self.id;
        self.broker.event_loop.call_soon(move || {
            let sub = Rc::new(SubscriberInner {
                event_loop: broker.event_loop.clone(),
                queue: RefCell::new(VecDeque::new()),
                waiting: RefCell::new(VecDeque::new()),
            });
            let mut map = broker.channels.borrow_mut();
            for channel in &channels {
                let subs = map.entry(channel.clone()).or_default();
                subs.retain(|s| s.strong_count() > 0);
                subs.push(Rc::downgrade(&sub));
            }
            drop(map);
            debug!(conn, ?channels, "loopback subscribed");
            reply(Ok(Rc::new(LoopbackSubscriber { inner: sub })));
        });
    }

    fn publish(&self, channel: &str, message: &str, reply: Reply<u64>) {
        let broker = self.broker.clone();
        let msg = Message::new(channel, message);
        self.broker.event_loop.call_soon(move || {
            let targets: Vec<Rc<SubscriberInner>> = broker
                .channels
                .borrow()
                .get(&msg.channel)
                .map(|subs| subs.iter().filter_map(Weak::upgrade).collect())
                .unwrap_or_default();
            broker.published.set(broker.published.get() + 1);
            trace!(channel = %msg.channel, receivers = targets.len(), "loopback publish");
            for sub in &targets {
                sub.push(msg.clone());
            }
            reply(Ok(targets.len() as u64));
        });
    }
}

struct SubscriberInner {
    event_loop: EventLoop,
    queue: RefCell<VecDeque<Message>>,
    waiting: RefCell<VecDeque<Reply<Message>>>,
}

impl SubscriberInner {
    fn push(&self, msg: Message) {
        let waiter = self.waiting.borrow_mut().pop_front();
        match waiter {
            Some(reply) => reply(Ok(msg)),
            None => self.queue.borrow_mut().push_back(msg),
        }
    }
}

struct LoopbackSubscriber {
    inner: Rc<SubscriberInner>,
}

impl Subscriber for LoopbackSubscriber {
    fn next_published(&self, reply: Reply<Message>) {
        let queued = self.inner.queue.borrow_mut().pop_front();
        match queued {
            Some(msg) => self.inner.event_loop.call_soon(move || reply(Ok(msg))),
            None => self.inner.waiting.borrow_mut().push_back(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbridge_runtime::{Future, RuntimeConfig, Scheduler};

    fn event_loop() -> EventLoop {
        EventLoop::new(Scheduler::new(RuntimeConfig::default().stack_size(64 * 1024))).unwrap()
    }

    #[test]
    fn test_replies_arrive_on_a_later_turn() {
        let lp = event_loop();
        let broker = LoopbackBroker::new(lp.clone());
        let fut: Future<bool> = Future::new();
        let f = fut.clone();
        broker.connect(Box::new(move |res| f.resolve(res.is_ok()).unwrap()));
        assert!(!fut.is_done());
        assert!(lp.run_until(&fut).unwrap());
        assert_eq!(broker.connections(), 1);
    }

    #[test]
    fn test_refused_connection() {
        let lp = event_loop();
        let broker = LoopbackBroker::new(lp.clone());
        broker.refuse_connections(true);
        let fut = Future::new();
        let f = fut.clone();
        broker.connect(Box::new(move |res| f.resolve(res.err()).unwrap()));
        assert_eq!(
            lp.run_until(&fut).unwrap(),
            Some(ChannelError::Connect("connection refused".into()))
        );
    }

    #[test]
    fn test_subscribers_and_publish_counts() {
        let lp = event_loop();
        let broker = LoopbackBroker::new(lp.clone());

        let conn_fut = Future::new();
        let f = conn_fut.clone();
        broker.connect(Box::new(move |res| f.resolve(res.ok()).unwrap()));
        let conn = lp.run_until(&conn_fut).unwrap().unwrap();

        let sub_fut = Future::new();
        let f = sub_fut.clone();
        conn.subscribe(&["foobar".to_string()], Box::new(move |res| f.resolve(res.ok()).unwrap()));
        let sub = lp.run_until(&sub_fut).unwrap().unwrap();
        assert_eq!(broker.subscriber_count("foobar"), 1);
        assert_eq!(broker.subscriber_count("other"), 0);

        let sent = Future::new();
        let f = sent.clone();
        conn.publish("foobar", "hello", Box::new(move |res| f.resolve(res.ok()).unwrap()));
        assert_eq!(lp.run_until(&sent).unwrap(), Some(1));
        assert_eq!(broker.published(), 1);

        drop(sub);
        drop(sub_fut);
        assert_eq!(broker.subscriber_count("foobar"), 0);

        let sent = Future::new();
        let f = sent.clone();
        conn.publish("foobar", "nobody", Box::new(move |res| f.resolve(res.ok()).unwrap()));
        assert_eq!(lp.run_until(&sent).unwrap(), Some(0));
        assert_eq!(broker.published(), 2);
    }
}
