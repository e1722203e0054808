//! Per-connection message inbox fed by a background receiver fiber
//!
//! The receiver fiber loops on `receive_next` and hands each message to the
//! inbox. The owning connection fiber pulls from the inbox with
//! [`Inbox::next`], typically inside a multi-wait.
//!
//! # Abandon contract
//!
//! An inbox belongs to one owner fiber. Once the owner has finished, or
//! the inbox was closed, the next arriving message is dropped and the
//! receiver exits without resuming anybody.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use greenbridge_core::error::{SchedResult, WaitError};
use greenbridge_runtime::{Fiber, Future, Scheduler, WeakFiber};
use tracing::{debug, error, warn};

use crate::adapter::{ChannelAdapter, ChannelFuture, Subscription};
use crate::client::Message;
use crate::error::ChannelError;

struct InboxState {
    queue: VecDeque<Message>,
    waiter: Option<ChannelFuture<Message>>,
    closed: bool,
    owner: WeakFiber,
    receiver: Option<Fiber>,
    delivered: u64,
    dropped: u64,
}

/// Buffered, owner-bound message queue
#[derive(Clone)]
pub struct Inbox {
    state: Rc<RefCell<InboxState>>,
    sched: Scheduler,
}

impl Inbox {
    fn new(sched: Scheduler, owner: &Fiber) -> Self {
        Self {
            state: Rc::new(RefCell::new(InboxState {
                queue: VecDeque::new(),
                waiter: None,
                closed: false,
                owner: owner.downgrade(),
                receiver: None,
                delivered: 0,
                dropped: 0,
            })),
            sched,
        }
    }

    /// Future of the next message
    ///
    /// Resolved already if a message is buffered. While one is pending,
    /// repeated calls return that same future.
    pub fn next(&self) -> ChannelFuture<Message> {
        let mut st = self.state.borrow_mut();
        if let Some(msg) = st.queue.pop_front() {
            return Future::ready(Ok(msg));
        }
        if st.closed {
            return Future::ready(Err(ChannelError::Closed));
        }
        if let Some(waiter) = &st.waiter {
            return waiter.clone();
        }
        let fut = Future::new();
        if let Some(owner) = st.owner.upgrade() {
            fut.set_owner(&owner);
        }
        st.waiter = Some(fut.clone());
        fut
    }

    /// Stop receiving: fails the pending `next`, cancels the receiver
    pub fn close(&self) {
        let (waiter, receiver) = {
            let mut st = self.state.borrow_mut();
            if st.closed && st.receiver.is_none() {
                return;
            }
            st.closed = true;
            (st.waiter.take(), st.receiver.take())
        };
        debug!("inbox closed");
        if let Some(waiter) = waiter {
            settle(&waiter, Err(ChannelError::Closed));
        }
        if let Some(receiver) = receiver {
            if let Err(err) = self.sched.cancel(&receiver) {
                error!(receiver = %receiver.id(), %err, "failed to cancel receiver fiber");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Buffered, not yet consumed
    pub fn len(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delivered(&self) -> u64 {
        self.state.borrow().delivered
    }

    /// Messages discarded under the abandon contract
    pub fn dropped(&self) -> u64 {
        self.state.borrow().dropped
    }

    pub fn receiver(&self) -> Option<Fiber> {
        self.state.borrow().receiver.clone()
    }

    /// Hand a message over; false tells the receiver to stop
    fn deliver(&self, msg: Message) -> bool {
        let waiter = {
            let mut st = self.state.borrow_mut();
            if st.closed {
                st.dropped += 1;
                debug!(channel = %msg.channel, "inbox closed, message dropped");
                return false;
            }
            if !st.owner.is_alive() {
                st.dropped += 1;
                st.closed = true;
                warn!(channel = %msg.channel, "owner finished, message dropped");
                return false;
            }
            st.delivered += 1;
            match st.waiter.take() {
                Some(waiter) => waiter,
                None => {
                    st.queue.push_back(msg);
                    return true;
                }
            }
        };
        // May resume the owner right here
        settle(&waiter, Ok(msg));
        true
    }

    /// Subscription ended from the client side
    fn fail(&self, err: ChannelError) {
        let waiter = {
            let mut st = self.state.borrow_mut();
            st.closed = true;
            st.receiver = None;
            st.waiter.take()
        };
        if let Some(waiter) = waiter {
            settle(&waiter, Err(err));
        }
    }

    fn finish_receiver(&self) {
        self.state.borrow_mut().receiver = None;
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("Inbox")
            .field("buffered", &st.queue.len())
            .field("closed", &st.closed)
            .field("owner", &st.owner)
            .finish()
    }
}

pub(crate) fn start(adapter: &ChannelAdapter, sub: Subscription, owner: &Fiber) -> SchedResult<Inbox> {
    let sched = adapter.event_loop().scheduler().clone();
    let inbox = Inbox::new(sched.clone(), owner);

    let (a, i) = (adapter.clone(), inbox.clone());
    let receiver = adapter
        .event_loop()
        .spawn(move || receive_loop(&a, &sub, &i))?;
    debug!(owner = %owner.id(), receiver = %receiver.id(), "receiver fiber started");
    inbox.state.borrow_mut().receiver = Some(receiver);
    Ok(inbox)
}

fn settle(waiter: &ChannelFuture<Message>, value: Result<Message, ChannelError>) {
    if let Err(err) = waiter.resolve(value) {
        error!(%err, "inbox waiter resolved twice");
    }
}

fn receive_loop(adapter: &ChannelAdapter, sub: &Subscription, inbox: &Inbox) {
    let sched = adapter.event_loop().scheduler();
    loop {
        if inbox.is_closed() || sched.is_cancelled() {
            break;
        }
        let fut = adapter.receive_next(sub);
        match fut.blocking_wait(sched) {
            Ok(Ok(msg)) => {
                if !inbox.deliver(msg) {
                    break;
                }
            }
            Ok(Err(err)) => {
                warn!(%err, "subscription failed");
                inbox.fail(err);
                break;
            }
            Err(WaitError::Cancelled) => {
                debug!("receiver cancelled");
                break;
            }
            Err(err) => {
                error!(%err, "receiver could not wait");
                inbox.fail(err.into());
                break;
            }
        }
    }
    inbox.finish_receiver();
}
