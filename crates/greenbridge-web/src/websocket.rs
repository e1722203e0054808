//! WebSocket handshake and frame codec (RFC 6455)
//!
//! The decoder works on a byte slice and reports how much it consumed, so
//! the connection keeps a single receive buffer and drains whole frames off
//! its front. Partial frames decode to `Ok(None)`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::error::WsError;
use crate::http::{Request, Response};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// 101 response completing the upgrade of `req`
///
/// The `Origin` header, when present, is echoed back as
/// `Sec-WebSocket-Origin`.
pub fn handshake_response(req: &Request) -> Result<Response, WsError> {
    let key = req.header("Sec-WebSocket-Key").ok_or(WsError::MissingKey)?;
    let mut resp = Response::new(101)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key(key));
    if let Some(origin) = req.header("Origin") {
        resp = resp.header("Sec-WebSocket-Origin", origin);
    }
    Ok(resp)
}

/// Which end of the connection is decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Peer frames must be masked
    Server,
    /// Peer frames must not be masked
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub const fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    pub fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WsError::InvalidOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(Opcode::Text, text.as_bytes())
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Close frame with an optional status code
    pub fn close(code: Option<u16>) -> Self {
        let payload = code.map(|c| c.to_be_bytes().to_vec()).unwrap_or_default();
        Self::new(Opcode::Close, payload)
    }

    /// Unmasked wire form, as a server sends it
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(None)
    }

    /// Masked wire form, as a client sends it
    pub fn encode_masked(&self, mask: [u8; 4]) -> Vec<u8> {
        self.encode_with(Some(mask))
    }

    fn encode_with(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);
        out.push(if self.fin { 0x80 } else { 0 } | self.opcode as u8);

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        if len <= 125 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }
        out
    }
}

pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decode one frame from the front of `buf`
///
/// Returns the frame and the number of bytes it occupied, or `None` if
/// `buf` does not yet hold a whole frame.
pub fn decode(buf: &[u8], role: Role, max_payload: usize) -> Result<Option<(Frame, usize)>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (b0, b1) = (buf[0], buf[1]);
    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(WsError::ReservedBitsSet);
    }
    let opcode = Opcode::from_u8(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;
    match role {
        Role::Server if !masked => return Err(WsError::UnmaskedClientFrame),
        Role::Client if masked => return Err(WsError::MaskedServerFrame),
        _ => {}
    }

    let len7 = b1 & 0x7F;
    if opcode.is_control() {
        if !fin {
            return Err(WsError::FragmentedControlFrame);
        }
        if len7 > 125 {
            return Err(WsError::ControlFrameTooLarge(len7 as usize));
        }
    }

    let mut pos = 2;
    let payload_len = match len7 {
        126 => {
            let Some(bytes) = buf.get(2..4) else {
                return Ok(None);
            };
            pos = 4;
            u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
        }
        127 => {
            let Some(bytes) = buf.get(2..10) else {
                return Ok(None);
            };
            pos = 10;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            u64::from_be_bytes(raw)
        }
        n => u64::from(n),
    };
    if payload_len > max_payload as u64 {
        return Err(WsError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let key = if masked {
        let Some(bytes) = buf.get(pos..pos + 4) else {
            return Ok(None);
        };
        pos += 4;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        None
    };

    let end = pos + payload_len as usize;
    let Some(body) = buf.get(pos..end) else {
        return Ok(None);
    };
    let mut payload = body.to_vec();
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }
    Ok(Some((Frame { fin, opcode, payload }, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_handshake_echoes_origin() {
        let req = Request::parse(
            b"GET /foobar/ HTTP/1.1\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nOrigin: http://localhost\r\n\r\n",
        )
        .unwrap();
        let resp = handshake_response(&req).unwrap();
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Origin: http://localhost\r\n"));
    }

    #[test]
    fn test_handshake_without_key() {
        let req = Request::parse(b"GET /foobar/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(handshake_response(&req).unwrap_err(), WsError::MissingKey);
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 section 5.7
        let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (frame, used) = decode(&wire, Role::Server, MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(frame, Frame::text("Hello"));
        assert_eq!(Frame::text("Hello").encode_masked(MASK), wire.to_vec());
    }

    #[test]
    fn test_server_frame_unmasked() {
        assert_eq!(Frame::text("Hello").encode(), b"\x81\x05Hello".to_vec());
    }

    #[test]
    fn test_extended_lengths() {
        let medium = Frame::new(Opcode::Binary, vec![7u8; 300]);
        let wire = medium.encode();
        assert_eq!(&wire[..4], &[0x82, 126, 0x01, 0x2c]);
        let (frame, used) = decode(&wire, Role::Client, MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!((frame, used), (medium, 304));

        let large = Frame::new(Opcode::Binary, vec![1u8; 70_000]);
        let wire = large.encode_masked(MASK);
        assert_eq!(wire[1], 0x80 | 127);
        let (frame, _) = decode(&wire, Role::Server, 100_000).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn test_partial_frame() {
        let wire = Frame::text("partial").encode_masked(MASK);
        for cut in 0..wire.len() {
            assert_eq!(decode(&wire[..cut], Role::Server, MAX_PAYLOAD).unwrap(), None);
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut wire = Frame::text("a").encode_masked(MASK);
        wire.extend(Frame::ping(b"hb".to_vec()).encode_masked(MASK));
        let (first, used) = decode(&wire, Role::Server, MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(first, Frame::text("a"));
        let (second, _) = decode(&wire[used..], Role::Server, MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(second, Frame::ping(b"hb".to_vec()));
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            decode(&Frame::text("x").encode(), Role::Server, MAX_PAYLOAD),
            Err(WsError::UnmaskedClientFrame)
        );
        assert_eq!(
            decode(&Frame::text("x").encode_masked(MASK), Role::Client, MAX_PAYLOAD),
            Err(WsError::MaskedServerFrame)
        );
        assert_eq!(decode(&[0x83, 0x80], Role::Server, MAX_PAYLOAD), Err(WsError::InvalidOpcode(3)));
        assert_eq!(decode(&[0xC1, 0x80], Role::Server, MAX_PAYLOAD), Err(WsError::ReservedBitsSet));
        assert_eq!(
            decode(&[0x09, 0x80], Role::Server, MAX_PAYLOAD),
            Err(WsError::FragmentedControlFrame)
        );
        assert_eq!(
            decode(&[0x89, 0xFE, 0x00, 0x80], Role::Server, MAX_PAYLOAD),
            Err(WsError::ControlFrameTooLarge(126))
        );
        assert_eq!(
            decode(&Frame::text("too long").encode_masked(MASK), Role::Server, 4),
            Err(WsError::PayloadTooLarge { size: 8, max: 4 })
        );
    }

    #[test]
    fn test_close_frame_code() {
        assert_eq!(Frame::close(Some(1000)).payload, vec![0x03, 0xE8]);
        assert!(Frame::close(None).payload.is_empty());
    }
}
