//! Per-connection socket and context
//!
//! The socket stays in blocking mode, so writes never suspend the fiber.
//! Reads use `MSG_DONTWAIT` and park on the loop's readability future when
//! nothing is available.

use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use greenbridge_core::ConnState;
use greenbridge_runtime::{EventLoop, Scheduler};
use tracing::{debug, trace, warn};

use crate::error::DriverError;

const RECV_CHUNK: usize = 4096;

/// Outcome of a non-blocking receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    Data(usize),
    WouldBlock,
    Eof,
}

/// TCP stream plus its receive buffer
pub struct Socket {
    stream: TcpStream,
    inbuf: RefCell<Vec<u8>>,
    eof: Cell<bool>,
}

impl Socket {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            inbuf: RefCell::new(Vec::new()),
            eof: Cell::new(false),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Receive whatever is available without blocking
    pub fn recv_nb(&self) -> io::Result<Recv> {
        if self.eof.get() {
            return Ok(Recv::Eof);
        }
        let mut tmp = [0u8; RECV_CHUNK];
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd(),
                    tmp.as_mut_ptr() as *mut libc::c_void,
                    tmp.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n > 0 {
                let n = n as usize;
                self.inbuf.borrow_mut().extend_from_slice(&tmp[..n]);
                return Ok(Recv::Data(n));
            }
            if n == 0 {
                self.eof.set(true);
                return Ok(Recv::Eof);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(Recv::WouldBlock),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }

    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(data)
    }

    pub fn is_eof(&self) -> bool {
        self.eof.get()
    }

    pub fn buffered_len(&self) -> usize {
        self.inbuf.borrow().len()
    }

    /// Run `f` over the buffered bytes
    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inbuf.borrow())
    }

    /// Remove and return the first `n` buffered bytes
    pub fn take(&self, n: usize) -> Vec<u8> {
        let mut buf = self.inbuf.borrow_mut();
        let n = n.min(buf.len());
        buf.drain(..n).collect()
    }

    pub fn consume(&self, n: usize) {
        let mut buf = self.inbuf.borrow_mut();
        let n = n.min(buf.len());
        buf.drain(..n);
    }

    pub fn shutdown(&self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            if err.kind() != io::ErrorKind::NotConnected {
                debug!(fd = self.fd(), %err, "shutdown failed");
            }
        }
    }
}

/// Everything a handler gets to see about its connection
pub struct ConnContext {
    event_loop: EventLoop,
    socket: Socket,
    peer: SocketAddr,
    secure: bool,
    state: Cell<ConnState>,
}

impl ConnContext {
    pub fn new(event_loop: EventLoop, stream: TcpStream, secure: bool) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            event_loop,
            socket: Socket::new(stream)?,
            peer,
            secure,
            state: Cell::new(ConnState::Started),
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.event_loop.scheduler()
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Served behind TLS termination
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    /// Move to `next`; an invalid transition is refused and logged
    pub fn transition(&self, next: ConnState) -> bool {
        let current = self.state.get();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(peer = %self.peer, from = %current, to = %next, "invalid connection transition");
            return false;
        }
        trace!(peer = %self.peer, from = %current, to = %next, "connection state");
        self.state.set(next);
        true
    }

    /// Read more bytes, parking the fiber until the socket is readable
    ///
    /// Returns the byte count, 0 on end of stream.
    pub fn fill(&self) -> Result<usize, DriverError> {
        loop {
            match self.socket.recv_nb()? {
                Recv::Data(n) => return Ok(n),
                Recv::Eof => return Ok(0),
                Recv::WouldBlock => {
                    let (ready, reg) = self.event_loop.readable(self.socket.fd());
                    if let Err(err) = ready.blocking_wait(self.scheduler()) {
                        self.event_loop.cancel(reg);
                        return Err(err.into());
                    }
                }
            }
        }
    }

    /// Enter `Closed`, drop the socket's registrations and shut it down
    pub fn close(&self) {
        if self.state.get() == ConnState::Closed {
            return;
        }
        self.transition(ConnState::Closed);
        self.event_loop.remove_readers(self.socket.fd());
        self.socket.shutdown();
        debug!(peer = %self.peer, "connection closed");
    }
}

impl std::fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnContext")
            .field("peer", &self.peer)
            .field("fd", &self.socket.fd())
            .field("state", &self.state.get())
            .finish()
    }
}
