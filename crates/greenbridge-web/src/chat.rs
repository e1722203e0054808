//! WebSocket chat application
//!
//! | Path           | Reply                                           |
//! |----------------|-------------------------------------------------|
//! | `/`            | HTML page that opens a socket to `/foobar/`     |
//! | `/favicon.ico` | empty icon                                      |
//! | `/trickle/`    | chunked stream, one paragraph per interval      |
//! | `/foobar/`     | WebSocket bridged to the pub/sub channel        |
//!
//! A `/foobar/` session parks on three triggers at once: the next channel
//! message, socket readability and the keep-alive timer. After every resume
//! it checks all three, so a trigger that fired without causing the resume
//! is handled in the same pass.

use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use greenbridge_channel::{ChannelAdapter, ChannelError, ChannelFuture, Connection, Inbox, Message};
use greenbridge_core::env::{env_get, env_get_bool, env_get_millis, env_get_str};
use greenbridge_core::ConnState;
use greenbridge_runtime::{wait_any, EventLoop, Future, Registration};
use tracing::{debug, trace};

use crate::conn::{ConnContext, Recv};
use crate::driver::{Handler, Reply, Session};
use crate::error::{DriverError, WsError};
use crate::http::{Request, Response, ResponseHead};
use crate::websocket::{self, Frame, Opcode, Role};

/// Library defaults
pub mod defaults {
    use std::time::Duration;

    pub const PORT: u16 = 9090;
    pub const BIND: &str = "0.0.0.0";
    pub const KEEPALIVE: Duration = Duration::from_secs(4);
    pub const TRICKLE_INTERVAL: Duration = Duration::from_millis(1000);
    pub const TRICKLE_CHUNKS: u32 = 32;
    pub const CHANNEL: &str = "foobar";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub bind: String,
    pub port: u16,
    /// Ping interval on idle sockets
    pub keepalive: Duration,
    pub trickle_interval: Duration,
    pub trickle_chunks: u32,
    /// Pub/sub channel bridged to every socket
    pub channel: String,
    /// Advertise `wss` on the index page
    pub secure: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bind: defaults::BIND.to_string(),
            port: defaults::PORT,
            keepalive: defaults::KEEPALIVE,
            trickle_interval: defaults::TRICKLE_INTERVAL,
            trickle_chunks: defaults::TRICKLE_CHUNKS,
            channel: defaults::CHANNEL.to_string(),
            secure: false,
        }
    }
}

impl ChatConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `GB_BIND`, `GB_PORT`, `GB_KEEPALIVE_SECS`,
    /// `GB_TRICKLE_INTERVAL_MS`, `GB_TRICKLE_CHUNKS`, `GB_CHANNEL`,
    /// `GB_SECURE`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind: env_get_str("GB_BIND", &d.bind),
            port: env_get("GB_PORT", d.port),
            keepalive: Duration::from_secs(env_get("GB_KEEPALIVE_SECS", d.keepalive.as_secs())),
            trickle_interval: env_get_millis("GB_TRICKLE_INTERVAL_MS", d.trickle_interval),
            trickle_chunks: env_get("GB_TRICKLE_CHUNKS", d.trickle_chunks),
            channel: env_get_str("GB_CHANNEL", &d.channel),
            secure: env_get_bool("GB_SECURE", d.secure),
        }
    }

    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn trickle(mut self, interval: Duration, chunks: u32) -> Self {
        self.trickle_interval = interval;
        self.trickle_chunks = chunks;
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// `bind:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

pub struct ChatApp {
    config: Rc<ChatConfig>,
    adapter: ChannelAdapter,
}

impl ChatApp {
    pub fn new(config: ChatConfig, adapter: ChannelAdapter) -> Self {
        Self {
            config: Rc::new(config),
            adapter,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn ws_scheme(&self, req: &Request, ctx: &ConnContext) -> &'static str {
        let forwarded_https = req
            .header("X-Forwarded-Proto")
            .is_some_and(|p| p.eq_ignore_ascii_case("https"));
        if self.config.secure || ctx.is_secure() || forwarded_https {
            "wss"
        } else {
            "ws"
        }
    }
}

impl Handler for ChatApp {
    fn handle(&self, req: &Request, ctx: &ConnContext) -> Result<Reply, DriverError> {
        match req.path.as_str() {
            "/" => {
                let host = req.header("Host").unwrap_or("localhost");
                let page = index_page(self.ws_scheme(req, ctx), host);
                Ok(Reply::Full(Response::html(page)))
            }
            "/favicon.ico" => Ok(Reply::Full(
                Response::new(200).header("Content-Type", "image/x-icon"),
            )),
            "/trickle/" => Ok(Reply::Stream {
                head: ResponseHead::new(200).header("Content-Type", "text/html; charset=UTF-8"),
                chunks: Box::new(Trickle::new(
                    ctx.event_loop().clone(),
                    self.config.trickle_interval,
                    self.config.trickle_chunks,
                )),
            }),
            "/foobar/" => {
                let response = match websocket::handshake_response(req) {
                    Ok(response) => response,
                    Err(err) => {
                        debug!(peer = %ctx.peer(), %err, "upgrade rejected");
                        return Ok(Reply::Full(Response::bad_request()));
                    }
                };
                Ok(Reply::Upgrade {
                    response,
                    session: Box::new(ChatSession::new(self.adapter.clone(), self.config.clone())),
                })
            }
            _ => Ok(Reply::Full(Response::not_found())),
        }
    }
}

fn index_page(scheme: &str, host: &str) -> String {
    format!(
        r#"<html>
  <head>
    <script language="Javascript">
      var s = new WebSocket("{scheme}://{host}/foobar/");
      s.onopen = function() {{
        s.send("ciao");
      }};
      s.onmessage = function(e) {{
        var bb = document.getElementById('blackboard');
        bb.innerHTML = bb.innerHTML + '<br/>' + e.data;
      }};
      s.onerror = function(e) {{
        alert(e);
      }};
      s.onclose = function(e) {{
        alert("connection closed");
      }};
      function invia() {{
        var value = document.getElementById('testo').value;
        s.send(value);
      }}
    </script>
  </head>
  <body>
    <h1>WebSocket (greenbridge)</h1>
    <form onsubmit="event.preventDefault(); return false;">
      <input type="text" id="testo"/>
      <input type="submit" value="invia" onclick="invia();" />
    </form>
    <div id="blackboard" style="width:640px;height:480px;background-color:black;color:white;border: solid 2px red;overflow:auto">
    </div>
  </body>
</html>
"#
    )
}

/// Paced chunk stream: sleeps one interval before every chunk but the first
/// and once more after the last
struct Trickle {
    event_loop: EventLoop,
    interval: Duration,
    total: u32,
    next: u32,
    finished: bool,
}

impl Trickle {
    fn new(event_loop: EventLoop, interval: Duration, total: u32) -> Self {
        Self {
            event_loop,
            interval,
            total,
            next: 0,
            finished: false,
        }
    }
}

impl Iterator for Trickle {
    type Item = Result<Vec<u8>, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.next > 0 {
            if let Err(err) = self.event_loop.sleep(self.interval) {
                self.finished = true;
                return Some(Err(err.into()));
            }
        }
        if self.next >= self.total {
            self.finished = true;
            return None;
        }
        let chunk = format!("<p>Hello {}</p>\n", self.next).into_bytes();
        self.next += 1;
        Some(Ok(chunk))
    }
}

/// `[<unix time>] <msg>`
fn stamp(msg: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    format!("[{}] {}", now, msg)
}

/// Send the close frame matching `err`; the session ends after this
fn reject(ctx: &ConnContext, err: WsError) -> DriverError {
    let _ = ctx.socket().write_all(&Frame::close(Some(err.close_code())).encode());
    err.into()
}

/// Pub/sub handles a session holds while running
struct Links {
    publisher: Connection,
    inbox: Inbox,
}

/// Pending futures the session parks on
struct Triggers {
    message: ChannelFuture<Message>,
    readable: Future<()>,
    readable_reg: Registration,
    keepalive: Future<()>,
    keepalive_reg: Registration,
}

impl Triggers {
    fn arm(ctx: &ConnContext, inbox: &Inbox, keepalive: Duration) -> Self {
        let lp = ctx.event_loop();
        let (readable, readable_reg) = lp.readable(ctx.socket().fd());
        let (keepalive, keepalive_reg) = lp.timer(keepalive);
        Self {
            message: inbox.next(),
            readable,
            readable_reg,
            keepalive,
            keepalive_reg,
        }
    }

    fn disarm(&self, ctx: &ConnContext) {
        let lp = ctx.event_loop();
        lp.cancel(self.readable_reg);
        lp.cancel(self.keepalive_reg);
    }
}

/// Releases everything a running session holds, on every exit path
struct Teardown<'a> {
    ctx: &'a ConnContext,
    links: Links,
    triggers: Triggers,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.triggers.disarm(self.ctx);
        if std::thread::panicking() {
            // Closing cancels the receiver fiber; no switching mid-unwind
            let inbox = self.links.inbox.clone();
            self.ctx.event_loop().call_soon(move || inbox.close());
        } else {
            self.links.inbox.close();
        }
        self.ctx.close();
    }
}

enum Flow {
    Continue,
    Close,
}

/// Duplex bridge between one WebSocket and the pub/sub channel
struct ChatSession {
    adapter: ChannelAdapter,
    config: Rc<ChatConfig>,
    /// Opcode and payload of a fragmented message in progress
    partial: Option<(Opcode, Vec<u8>)>,
}

impl ChatSession {
    fn new(adapter: ChannelAdapter, config: Rc<ChatConfig>) -> Self {
        Self {
            adapter,
            config,
            partial: None,
        }
    }

    /// Subscriber connection, subscription, publisher connection, inbox
    fn setup(&self, ctx: &ConnContext) -> Result<Links, DriverError> {
        let a = &self.adapter;
        let sub_conn = a.wait(&a.connect())?;
        let subscription = a.wait(&a.subscribe(&sub_conn, &[self.config.channel.as_str()]))?;
        let publisher = a.wait(&a.connect())?;
        let inbox = a.listen(subscription, &ctx.scheduler().current())?;
        Ok(Links { publisher, inbox })
    }

    fn pump(&mut self, ctx: &ConnContext, links: &Links, triggers: &mut Triggers) -> Result<(), DriverError> {
        let lp = ctx.event_loop().clone();
        let sock = ctx.socket();
        // Bytes that arrived with the handshake
        let mut pending_input = sock.buffered_len() > 0;

        loop {
            if !pending_input {
                ctx.transition(ConnState::AwaitingEvent);
                wait_any(
                    ctx.scheduler(),
                    &[&triggers.message, &triggers.readable, &triggers.keepalive],
                )?;
                ctx.transition(ConnState::Running);
            }

            if let Some(result) = triggers.message.result() {
                let msg = result?;
                trace!(channel = %msg.channel, "forwarding to peer");
                sock.write_all(&Frame::text(&stamp(&msg.value)).encode())?;
                triggers.message = links.inbox.next();
            }

            if triggers.readable.is_done() {
                match sock.recv_nb()? {
                    Recv::Eof => {
                        debug!(peer = %ctx.peer(), "peer closed the socket");
                        return Ok(());
                    }
                    Recv::Data(_) | Recv::WouldBlock => {}
                }
                let (readable, reg) = lp.readable(sock.fd());
                triggers.readable = readable;
                triggers.readable_reg = reg;
                pending_input = true;
            }

            if pending_input {
                pending_input = false;
                if let Flow::Close = self.process_frames(ctx, links)? {
                    return Ok(());
                }
            }

            if triggers.keepalive.is_done() {
                sock.write_all(&Frame::ping(Vec::new()).encode())?;
                let (keepalive, reg) = lp.timer(self.config.keepalive);
                triggers.keepalive = keepalive;
                triggers.keepalive_reg = reg;
            }
        }
    }

    /// Handle every whole frame in the receive buffer
    fn process_frames(&mut self, ctx: &ConnContext, links: &Links) -> Result<Flow, DriverError> {
        let sock = ctx.socket();
        loop {
            let decoded = sock.with_buffer(|buf| websocket::decode(buf, Role::Server, websocket::MAX_PAYLOAD));
            let (frame, used) = match decoded {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(Flow::Continue),
                Err(err) => return Err(reject(ctx, err)),
            };
            sock.consume(used);

            match frame.opcode {
                Opcode::Text | Opcode::Binary if self.partial.is_some() => {
                    return Err(reject(ctx, WsError::InterleavedDataFrame));
                }
                Opcode::Text | Opcode::Binary if frame.fin => {
                    self.publish(ctx, links, frame.payload)?;
                }
                Opcode::Text | Opcode::Binary => {
                    self.partial = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let Some((_, buf)) = self.partial.as_mut() else {
                        return Err(reject(ctx, WsError::UnexpectedContinuation));
                    };
                    buf.extend_from_slice(&frame.payload);
                    if buf.len() > websocket::MAX_PAYLOAD {
                        let size = buf.len() as u64;
                        return Err(reject(
                            ctx,
                            WsError::PayloadTooLarge {
                                size,
                                max: websocket::MAX_PAYLOAD,
                            },
                        ));
                    }
                    if frame.fin {
                        if let Some((_, payload)) = self.partial.take() {
                            self.publish(ctx, links, payload)?;
                        }
                    }
                }
                Opcode::Ping => {
                    sock.write_all(&Frame::pong(frame.payload).encode())?;
                }
                Opcode::Pong => trace!(peer = %ctx.peer(), "pong"),
                Opcode::Close => {
                    let _ = sock.write_all(&Frame::new(Opcode::Close, frame.payload).encode());
                    debug!(peer = %ctx.peer(), "close frame received");
                    return Ok(Flow::Close);
                }
            }
        }
    }

    fn publish(&self, ctx: &ConnContext, links: &Links, payload: Vec<u8>) -> Result<(), DriverError> {
        let text = String::from_utf8(payload).map_err(|_| reject(ctx, WsError::InvalidUtf8))?;
        self.adapter
            .publish_detached(&links.publisher, &self.config.channel, &text);
        Ok(())
    }
}

impl Session for ChatSession {
    fn run(mut self: Box<Self>, ctx: &ConnContext) -> Result<(), DriverError> {
        ctx.transition(ConnState::AwaitingSetup);
        let links = self.setup(ctx)?;
        ctx.transition(ConnState::Running);
        debug!(peer = %ctx.peer(), channel = %self.config.channel, "chat session running");

        let triggers = Triggers::arm(ctx, &links.inbox, self.config.keepalive);
        let mut teardown = Teardown { ctx, links, triggers };
        let result = self.pump(ctx, &teardown.links, &mut teardown.triggers);
        drop(teardown);

        match result {
            Err(DriverError::Channel(ChannelError::Closed)) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbridge_channel::LoopbackBroker;
    use greenbridge_runtime::{RuntimeConfig, Scheduler};
    use std::cell::RefCell;
    use std::net::{TcpListener, TcpStream};
    use std::panic::AssertUnwindSafe;

    #[test]
    fn test_config_defaults() {
        let c = ChatConfig::default();
        assert_eq!(c.port, 9090);
        assert_eq!(c.bind, "0.0.0.0");
        assert_eq!(c.keepalive, Duration::from_secs(4));
        assert_eq!(c.trickle_interval, Duration::from_millis(1000));
        assert_eq!(c.trickle_chunks, 32);
        assert_eq!(c.channel, "foobar");
        assert_eq!(c.addr(), "0.0.0.0:9090");
    }

    #[test]
    fn test_config_builder() {
        let c = ChatConfig::new()
            .bind("127.0.0.1")
            .port(0)
            .trickle(Duration::from_millis(5), 3)
            .channel("room");
        assert_eq!(c.addr(), "127.0.0.1:0");
        assert_eq!(c.trickle_chunks, 3);
        assert_eq!(c.channel, "room");
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("GB_PORT", "9191");
        std::env::set_var("GB_TRICKLE_CHUNKS", "4");
        std::env::set_var("GB_KEEPALIVE_SECS", "not-a-number");
        let c = ChatConfig::from_env();
        std::env::remove_var("GB_PORT");
        std::env::remove_var("GB_TRICKLE_CHUNKS");
        std::env::remove_var("GB_KEEPALIVE_SECS");
        assert_eq!(c.port, 9191);
        assert_eq!(c.trickle_chunks, 4);
        assert_eq!(c.keepalive, Duration::from_secs(4));
    }

    #[test]
    fn test_stamp_format() {
        let s = stamp("ciao");
        let (ts, rest) = s.split_once("] ").unwrap();
        assert_eq!(rest, "ciao");
        let secs: f64 = ts.trim_start_matches('[').parse().unwrap();
        assert!(secs > 1_600_000_000.0);
    }

    #[test]
    fn test_index_page_scheme() {
        let page = index_page("wss", "example.com:8443");
        assert!(page.contains(r#"new WebSocket("wss://example.com:8443/foobar/")"#));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(WsError::InterleavedDataFrame.close_code(), 1002);
        assert_eq!(WsError::UnexpectedContinuation.close_code(), 1002);
        assert_eq!(WsError::InvalidUtf8.close_code(), 1007);
        assert_eq!(WsError::PayloadTooLarge { size: 2, max: 1 }.close_code(), 1009);
    }

    #[test]
    fn test_teardown_runs_when_session_panics() {
        let lp = EventLoop::new(Scheduler::new(RuntimeConfig::default().stack_size(64 * 1024))).unwrap();
        let broker = LoopbackBroker::new(lp.clone());
        let adapter = ChannelAdapter::new(lp.clone(), Rc::new(broker));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let ctx = Rc::new(ConnContext::new(lp.clone(), server, false).unwrap());
        let receiver = Rc::new(RefCell::new(None));

        let (c, r) = (ctx.clone(), receiver.clone());
        lp.spawn(move || {
            let session = ChatSession::new(adapter, Rc::new(ChatConfig::default()));
            let links = session.setup(&c).unwrap();
            *r.borrow_mut() = links.inbox.receiver();
            let triggers = Triggers::arm(&c, &links.inbox, Duration::from_secs(60));
            let caught = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let _teardown = Teardown {
                    ctx: &c,
                    links,
                    triggers,
                };
                panic!("session failed mid-pump");
            }));
            assert!(caught.is_err());
        })
        .unwrap();
        lp.run().unwrap();

        let receiver = receiver.borrow_mut().take().unwrap();
        assert!(!receiver.is_alive());
        assert_eq!(ctx.state(), ConnState::Closed);
        let timers = lp.timer_stats();
        assert_eq!(timers.active, 0);
        assert_eq!(timers.total_fired, 0);
        assert_eq!(timers.total_cancelled, 1);
    }
}
