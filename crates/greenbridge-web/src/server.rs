//! TCP accept loop
//!
//! The listener is non-blocking and the accept loop is itself a fiber that
//! parks on readability. Each accepted connection gets its own fiber running
//! [`driver::serve`].

use std::cell::Cell;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use greenbridge_core::error::{SchedResult, WaitError};
use greenbridge_runtime::{EventLoop, Fiber};
use tracing::{debug, error, info, warn};

use crate::conn::ConnContext;
use crate::driver::{self, Handler};

#[derive(Debug, Default)]
struct Counters {
    accepted: Cell<u64>,
    active: Cell<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    pub accepted: u64,
    pub active: u64,
}

pub struct Server {
    event_loop: EventLoop,
    listener: Rc<TcpListener>,
    handler: Rc<dyn Handler>,
    secure: bool,
    counters: Rc<Counters>,
    acceptor: Cell<Option<Fiber>>,
}

impl Server {
    pub fn bind(
        event_loop: EventLoop,
        addr: impl ToSocketAddrs,
        handler: Rc<dyn Handler>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            event_loop,
            listener: Rc::new(listener),
            handler,
            secure: false,
            counters: Rc::new(Counters::default()),
            acceptor: Cell::new(None),
        })
    }

    /// Mark connections as served behind TLS termination
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.counters.accepted.get(),
            active: self.counters.active.get(),
        }
    }

    /// Spawn the accept fiber
    pub fn start(&self) -> SchedResult<()> {
        let acceptor = Acceptor {
            event_loop: self.event_loop.clone(),
            listener: self.listener.clone(),
            handler: self.handler.clone(),
            secure: self.secure,
            counters: self.counters.clone(),
        };
        let fiber = self.event_loop.spawn(move || acceptor.run())?;
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "listening");
        }
        self.acceptor.set(Some(fiber));
        Ok(())
    }

    /// Stop accepting; connections already open run to completion
    pub fn shutdown(&self) {
        if let Some(fiber) = self.acceptor.take() {
            if fiber.is_alive() {
                if let Err(err) = self.event_loop.scheduler().cancel(&fiber) {
                    error!(%err, "failed to cancel accept fiber");
                }
            }
        }
    }
}

struct Acceptor {
    event_loop: EventLoop,
    listener: Rc<TcpListener>,
    handler: Rc<dyn Handler>,
    secure: bool,
    counters: Rc<Counters>,
}

impl Acceptor {
    fn run(self) {
        let fd = self.listener.as_raw_fd();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted");
                    self.dispatch(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let (ready, reg) = self.event_loop.readable(fd);
                    match ready.blocking_wait(self.event_loop.scheduler()) {
                        Ok(()) => {}
                        Err(WaitError::Cancelled) => {
                            self.event_loop.cancel(reg);
                            debug!("accept loop cancelled");
                            return;
                        }
                        Err(err) => {
                            self.event_loop.cancel(reg);
                            error!(%err, "accept loop cannot wait");
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    // EMFILE and friends: yield a turn rather than spin
                    warn!(%err, "accept failed");
                    if self.event_loop.sleep(std::time::Duration::from_millis(10)).is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, stream: std::net::TcpStream) {
        let ctx = match ConnContext::new(self.event_loop.clone(), stream, self.secure) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(%err, "cannot set up connection");
                return;
            }
        };
        let handler = self.handler.clone();
        let counters = self.counters.clone();
        counters.accepted.set(counters.accepted.get() + 1);
        counters.active.set(counters.active.get() + 1);
        let spawned = self.event_loop.spawn(move || {
            driver::serve(&*handler, &ctx);
            counters.active.set(counters.active.get() - 1);
        });
        if let Err(err) = spawned {
            self.counters.active.set(self.counters.active.get() - 1);
            error!(%err, "cannot spawn connection fiber");
        }
    }
}
