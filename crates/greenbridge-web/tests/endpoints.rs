//! End-to-end tests: a real server on its own thread, plain std clients

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use greenbridge_channel::{ChannelAdapter, LoopbackBroker};
use greenbridge_runtime::{logging, EventLoop, RemoteHandle, RuntimeConfig, Scheduler};
use greenbridge_web::websocket::{self, MAX_PAYLOAD};
use greenbridge_web::{
    ChatApp, ChatConfig, ConnContext, DriverError, Frame, Handler, Opcode, Reply, Request, Response,
    Role, Server,
};

const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

struct TestServer {
    addr: SocketAddr,
    remote: RemoteHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start<F>(make_handler: F) -> Self
    where
        F: FnOnce(&EventLoop) -> Rc<dyn Handler> + Send + 'static,
    {
        logging::init_test();
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let sched = Scheduler::new(RuntimeConfig::default().stack_size(128 * 1024));
            let lp = EventLoop::new(sched).unwrap();
            let server = Server::bind(lp.clone(), "127.0.0.1:0", make_handler(&lp)).unwrap();
            server.start().unwrap();
            tx.send((server.local_addr().unwrap(), lp.remote())).unwrap();
            lp.run().unwrap();
        });
        let (addr, remote) = rx.recv().unwrap();
        Self {
            addr,
            remote,
            thread: Some(thread),
        }
    }

    fn chat(config: ChatConfig) -> Self {
        Self::start(move |lp| {
            let broker = LoopbackBroker::new(lp.clone());
            let adapter = ChannelAdapter::new(lp.clone(), Rc::new(broker));
            Rc::new(ChatApp::new(config, adapter))
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.remote.call(|lp| lp.stop());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn test_config() -> ChatConfig {
    ChatConfig::new()
        .bind("127.0.0.1")
        .port(0)
        .keepalive(Duration::from_secs(60))
        .trickle(Duration::from_millis(50), 32)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

/// Send a request and read the whole response until the server closes
fn get(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> String {
    let mut stream = connect(addr);
    let mut req = format!("GET {} HTTP/1.1\r\nHost: chat.local\r\n", path);
    for (name, value) in headers {
        req.push_str(&format!("{}: {}\r\n", name, value));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    out
}

struct WsClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl WsClient {
    fn open(addr: SocketAddr) -> Self {
        let mut stream = connect(addr);
        stream
            .write_all(
                b"GET /foobar/ HTTP/1.1\r\nHost: chat.local\r\nUpgrade: websocket\r\n\
                  Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .unwrap();

        // Byte at a time, so no frame bytes are swallowed with the head
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", head);
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn send(&mut self, frame: &Frame) {
        self.stream.write_all(&frame.encode_masked(MASK)).unwrap();
    }

    fn send_text(&mut self, text: &str) {
        self.send(&Frame::text(text));
    }

    /// Next frame, or `None` once the server closed the socket
    fn recv(&mut self) -> Option<Frame> {
        let mut tmp = [0u8; 1024];
        loop {
            if let Some((frame, used)) = websocket::decode(&self.buf, Role::Client, MAX_PAYLOAD).unwrap() {
                self.buf.drain(..used);
                return Some(frame);
            }
            let n = self.stream.read(&mut tmp).unwrap();
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Next text frame, skipping keep-alive pings
    fn recv_text(&mut self) -> String {
        loop {
            let frame = self.recv().expect("socket closed while waiting for text");
            if frame.opcode == Opcode::Text {
                return String::from_utf8(frame.payload).unwrap();
            }
        }
    }
}

/// Split `[<time>] <msg>` and check the timestamp
fn unstamp(text: &str) -> &str {
    let (ts, msg) = text.split_once("] ").expect("missing timestamp");
    let secs: f64 = ts.trim_start_matches('[').parse().expect("timestamp is not a number");
    assert!(secs > 1_600_000_000.0);
    msg
}

#[test]
fn test_index_page_points_at_socket() {
    let server = TestServer::chat(test_config());
    let resp = get(server.addr, "/", &[]);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.contains("Content-Type: text/html; charset=UTF-8\r\n"));
    assert!(resp.contains(r#"new WebSocket("ws://chat.local/foobar/")"#));

    let resp = get(server.addr, "/", &[("X-Forwarded-Proto", "https")]);
    assert!(resp.contains(r#"new WebSocket("wss://chat.local/foobar/")"#));
}

#[test]
fn test_favicon_is_empty_icon() {
    let server = TestServer::chat(test_config());
    let resp = get(server.addr, "/favicon.ico", &[]);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.contains("Content-Type: image/x-icon\r\n"));
    assert!(resp.contains("Content-Length: 0\r\n"));
    assert!(resp.ends_with("\r\n\r\n"));
}

#[test]
fn test_unknown_path_is_404() {
    let server = TestServer::chat(test_config());
    let resp = get(server.addr, "/nope", &[]);
    assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn test_malformed_request_is_400() {
    let server = TestServer::chat(test_config());
    let mut stream = connect(server.addr);
    stream.write_all(b"NONSENSE\r\n\r\n").unwrap();
    let mut resp = String::new();
    stream.read_to_string(&mut resp).unwrap();
    assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn test_upgrade_without_key_is_400() {
    let server = TestServer::chat(test_config());
    let resp = get(server.addr, "/foobar/", &[("Upgrade", "websocket"), ("Connection", "Upgrade")]);
    assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn test_trickle_streams_paced_chunks() {
    let interval = Duration::from_millis(50);
    let server = TestServer::chat(test_config().trickle(interval, 32));
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /trickle/ HTTP/1.1\r\nHost: chat.local\r\n\r\n")
        .unwrap();
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "HTTP/1.1 200 OK\r\n");
    let mut chunked = false;
    loop {
        line.clear();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" {
            break;
        }
        chunked |= line.eq_ignore_ascii_case("Transfer-Encoding: chunked\r\n");
    }
    assert!(chunked);

    let mut arrivals = Vec::new();
    let mut bodies = Vec::new();
    loop {
        line.clear();
        reader.read_line(&mut line).unwrap();
        let size = usize::from_str_radix(line.trim_end(), 16).unwrap();
        let mut data = vec![0u8; size + 2];
        reader.read_exact(&mut data).unwrap();
        assert_eq!(&data[size..], b"\r\n");
        if size == 0 {
            break;
        }
        arrivals.push(Instant::now());
        data.truncate(size);
        bodies.push(String::from_utf8(data).unwrap());
    }

    assert_eq!(bodies.len(), 32);
    for (i, body) in bodies.iter().enumerate() {
        assert_eq!(body, &format!("<p>Hello {}</p>\n", i));
    }
    for pair in arrivals.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(40), "chunks too close: {:?}", pair[1] - pair[0]);
    }
    assert!(arrivals[31] - arrivals[0] >= interval * 31);

    // Connection ends after the terminating chunk
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_trickle_does_not_block_other_connections() {
    let server = TestServer::chat(test_config().trickle(Duration::from_millis(200), 32));
    let mut slow = connect(server.addr);
    slow.write_all(b"GET /trickle/ HTTP/1.1\r\nHost: chat.local\r\n\r\n").unwrap();
    let mut first = [0u8; 16];
    slow.read_exact(&mut first).unwrap();

    let started = Instant::now();
    let resp = get(server.addr, "/favicon.ico", &[]);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_socket_messages_reach_every_subscriber_in_order() {
    let server = TestServer::chat(test_config());
    let mut alice = WsClient::open(server.addr);
    let mut bob = WsClient::open(server.addr);
    // Let both sessions finish subscribing
    thread::sleep(Duration::from_millis(200));

    alice.send_text("ciao");
    assert_eq!(unstamp(&alice.recv_text()), "ciao");
    assert_eq!(unstamp(&bob.recv_text()), "ciao");

    for msg in ["one", "two", "three"] {
        bob.send_text(msg);
    }
    for msg in ["one", "two", "three"] {
        assert_eq!(unstamp(&alice.recv_text()), msg);
        assert_eq!(unstamp(&bob.recv_text()), msg);
    }
}

#[test]
fn test_each_frame_published_once() {
    let server = TestServer::chat(test_config());
    let mut alice = WsClient::open(server.addr);
    thread::sleep(Duration::from_millis(100));

    // Two frames in one write, plus a fragmented message
    let mut wire = Frame::text("first").encode_masked(MASK);
    wire.extend(Frame::text("second").encode_masked(MASK));
    alice.stream.write_all(&wire).unwrap();
    let mut start = Frame::text("thi");
    start.fin = false;
    alice.send(&start);
    alice.send(&Frame::new(Opcode::Continuation, b"rd".to_vec()));

    assert_eq!(unstamp(&alice.recv_text()), "first");
    assert_eq!(unstamp(&alice.recv_text()), "second");
    assert_eq!(unstamp(&alice.recv_text()), "third");

    alice.stream.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let mut tmp = [0u8; 64];
    let err = alice.stream.read(&mut tmp).unwrap_err();
    assert!(matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    ));
}

#[test]
fn test_ping_gets_pong() {
    let server = TestServer::chat(test_config());
    let mut client = WsClient::open(server.addr);
    client.send(&Frame::ping(b"hb".to_vec()));
    let frame = client.recv().unwrap();
    assert_eq!(frame, Frame::pong(b"hb".to_vec()));
}

#[test]
fn test_keepalive_pings_rearm() {
    let server = TestServer::chat(test_config().keepalive(Duration::from_millis(100)));
    let mut client = WsClient::open(server.addr);
    let started = Instant::now();
    for _ in 0..3 {
        let frame = client.recv().unwrap();
        assert_eq!(frame.opcode, Opcode::Ping);
    }
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[test]
fn test_close_frame_ends_session() {
    let server = TestServer::chat(test_config());
    let mut client = WsClient::open(server.addr);
    client.send(&Frame::close(Some(1000)));
    let frame = client.recv().unwrap();
    assert_eq!(frame.opcode, Opcode::Close);
    assert_eq!(frame.payload, vec![0x03, 0xE8]);
    assert!(client.recv().is_none());
}

#[test]
fn test_unmasked_frame_closes_with_protocol_error() {
    let server = TestServer::chat(test_config());
    let mut client = WsClient::open(server.addr);
    client.stream.write_all(&Frame::text("bare").encode()).unwrap();
    let frame = client.recv().unwrap();
    assert_eq!(frame, Frame::close(Some(1002)));
    assert!(client.recv().is_none());
}

#[test]
fn test_interleaved_data_frame_closes_with_protocol_error() {
    let server = TestServer::chat(test_config());
    let mut alice = WsClient::open(server.addr);
    let mut bob = WsClient::open(server.addr);
    thread::sleep(Duration::from_millis(100));

    let mut start = Frame::text("lost-");
    start.fin = false;
    alice.send(&start);
    alice.send_text("new");
    assert_eq!(alice.recv().unwrap(), Frame::close(Some(1002)));
    assert!(alice.recv().is_none());

    // Neither half of the broken sequence reached the channel
    bob.send_text("after");
    assert_eq!(unstamp(&bob.recv_text()), "after");
}

#[test]
fn test_orphan_continuation_closes_with_protocol_error() {
    let server = TestServer::chat(test_config());
    let mut client = WsClient::open(server.addr);
    client.send(&Frame::new(Opcode::Continuation, b"tail".to_vec()));
    assert_eq!(client.recv().unwrap(), Frame::close(Some(1002)));
    assert!(client.recv().is_none());
}

#[test]
fn test_handshake_leftover_bytes_are_processed() {
    let server = TestServer::chat(test_config());
    let mut stream = connect(server.addr);
    let mut wire = b"GET /foobar/ HTTP/1.1\r\nHost: chat.local\r\nUpgrade: websocket\r\n\
                     Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
        .to_vec();
    wire.extend(Frame::ping(b"early".to_vec()).encode_masked(MASK));
    stream.write_all(&wire).unwrap();

    let mut client = WsClient {
        stream,
        buf: Vec::new(),
    };
    let mut tmp = [0u8; 512];
    while websocket::decode(&after_head(&client.buf), Role::Client, MAX_PAYLOAD)
        .unwrap()
        .is_none()
    {
        let n = client.stream.read(&mut tmp).unwrap();
        assert!(n > 0);
        client.buf.extend_from_slice(&tmp[..n]);
    }
    let frames = after_head(&client.buf);
    let (frame, _) = websocket::decode(&frames, Role::Client, MAX_PAYLOAD).unwrap().unwrap();
    assert_eq!(frame, Frame::pong(b"early".to_vec()));
}

fn after_head(buf: &[u8]) -> Vec<u8> {
    match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => buf[pos + 4..].to_vec(),
        None => Vec::new(),
    }
}

struct Flaky;

impl Handler for Flaky {
    fn handle(&self, req: &Request, _ctx: &ConnContext) -> Result<Reply, DriverError> {
        match req.path.as_str() {
            "/boom" => panic!("handler blew up"),
            "/fail" => Err(DriverError::PeerClosed),
            _ => Ok(Reply::Full(Response::new(200).body(b"ok".to_vec()))),
        }
    }
}

#[test]
fn test_handler_failures_stay_on_their_connection() {
    let server = TestServer::start(|_| Rc::new(Flaky));

    let resp = get(server.addr, "/boom", &[]);
    assert!(resp.is_empty());

    let resp = get(server.addr, "/fail", &[]);
    assert!(resp.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));

    let resp = get(server.addr, "/", &[]);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.ends_with("ok"));
}
