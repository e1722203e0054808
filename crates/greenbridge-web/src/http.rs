//! Minimal HTTP/1.1 request parsing and response encoding
//!
//! One request per connection: every response carries `Connection: close`.

use std::fmt::Write as _;

use crate::error::HttpError;

/// Largest request head accepted
pub const MAX_HEAD: usize = 16 * 1024;

/// Largest request body accepted
pub const MAX_BODY: usize = 64 * 1024;

/// Terminating chunk of a chunked body
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Offset just past the `\r\n\r\n` ending the request head
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse a request head (request line and headers, up to the blank line)
    pub fn parse(head: &[u8]) -> Result<Self, HttpError> {
        let text = std::str::from_utf8(head).map_err(|_| HttpError::BadRequestLine)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or(HttpError::BadRequestLine)?;
        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) if !m.is_empty() && t.starts_with('/') => (m, t, v),
            _ => return Err(HttpError::BadRequestLine),
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HttpError::BadRequestLine);
        }
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(HttpError::BadHeader)?;
            if name.is_empty() || name.contains(' ') {
                return Err(HttpError::BadHeader);
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            query,
            version: version.to_string(),
            headers,
            body: Vec::new(),
        })
    }

    /// First header named `name`, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Result<usize, HttpError> {
        match self.header("Content-Length") {
            Some(v) => v.parse().map_err(|_| HttpError::BadHeader),
            None => Ok(0),
        }
    }

    /// `Connection: Upgrade` with `Upgrade: websocket`
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let connection = self.header("Connection").is_some_and(|v| {
            v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        });
        upgrade && connection
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Status line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(128);
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Head for a chunked body
    pub fn chunked(self) -> Self {
        self.header("Transfer-Encoding", "chunked")
            .header("Connection", "close")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            head: ResponseHead::new(status),
            body: Vec::new(),
        }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self::new(200)
            .header("Content-Type", "text/html; charset=UTF-8")
            .body(body.into().into_bytes())
    }

    pub fn not_found() -> Self {
        Self::new(404)
            .header("Content-Type", "text/plain")
            .body(b"Not Found".to_vec())
    }

    pub fn bad_request() -> Self {
        Self::new(400)
            .header("Content-Type", "text/plain")
            .body(b"Bad Request".to_vec())
    }

    pub fn internal_error() -> Self {
        Self::new(500)
            .header("Content-Type", "text/plain")
            .body(b"Internal Server Error".to_vec())
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.head = self.head.header(name, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Wire form; adds `Content-Length` and `Connection: close`
    ///
    /// A 101 response is sent as-is, since the connection stays open.
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = if self.head.status == 101 {
            self.head.clone()
        } else {
            self.head
                .clone()
                .header("Content-Length", self.body.len().to_string())
                .header("Connection", "close")
        };
        let mut out = head.to_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// One chunk of a chunked body; empty input yields nothing
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nrest"), Some(27));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
        assert_eq!(find_head_end(b""), None);
    }

    #[test]
    fn test_parse_request() {
        let req = Request::parse(
            b"GET /trickle/?n=3 HTTP/1.1\r\nHost: example.com\r\ncontent-length: 4\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/trickle/");
        assert_eq!(req.query.as_deref(), Some("n=3"));
        assert_eq!(req.header("HOST"), Some("example.com"));
        assert_eq!(req.content_length().unwrap(), 4);
        assert!(!req.is_websocket_upgrade());
    }

    #[test]
    fn test_parse_upgrade() {
        let req = Request::parse(
            b"GET /foobar/ HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\n\r\n",
        )
        .unwrap();
        assert!(req.is_websocket_upgrade());
    }

    #[test]
    fn test_bad_request_line() {
        assert!(matches!(Request::parse(b"GARBAGE\r\n\r\n"), Err(HttpError::BadRequestLine)));
        assert!(matches!(
            Request::parse(b"GET noslash HTTP/1.1\r\n\r\n"),
            Err(HttpError::BadRequestLine)
        ));
        assert!(matches!(
            Request::parse(b"GET / SPDY/3\r\n\r\n"),
            Err(HttpError::BadRequestLine)
        ));
    }

    #[test]
    fn test_bad_header() {
        assert!(matches!(
            Request::parse(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
            Err(HttpError::BadHeader)
        ));
    }

    #[test]
    fn test_response_bytes() {
        let bytes = Response::new(200)
            .header("Content-Type", "image/x-icon")
            .to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: image/x-icon\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_switching_protocols_has_no_length() {
        let text = String::from_utf8(Response::new(101).to_bytes()).unwrap();
        assert_eq!(text, "HTTP/1.1 101 Switching Protocols\r\n\r\n");
    }

    #[test]
    fn test_encode_chunk() {
        assert_eq!(encode_chunk(b"<p>Hello 0</p>\n"), b"f\r\n<p>Hello 0</p>\n\r\n".to_vec());
        assert!(encode_chunk(b"").is_empty());
    }
}
