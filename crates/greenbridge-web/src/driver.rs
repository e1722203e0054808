//! Handler driver
//!
//! Runs on the connection's fiber: read one request, hand it to the
//! handler, then write what it returns. A reply is a whole response, a
//! chunk stream whose `next()` may park the fiber between chunks, or an
//! upgrade that takes over the connection.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, warn};

use crate::conn::ConnContext;
use crate::error::{DriverError, HttpError};
use crate::http::{self, Request, Response, ResponseHead};

/// Chunks of a streamed body
pub type ChunkStream = Box<dyn Iterator<Item = Result<Vec<u8>, DriverError>>>;

/// What a handler returns for a request
pub enum Reply {
    Full(Response),
    /// Chunked body; the connection closes after the last chunk
    Stream { head: ResponseHead, chunks: ChunkStream },
    /// Write `response` (a 101) and hand the connection to `session`
    Upgrade { response: Response, session: Box<dyn Session> },
}

pub trait Handler {
    fn handle(&self, req: &Request, ctx: &ConnContext) -> Result<Reply, DriverError>;
}

/// Owner of an upgraded connection until it ends
pub trait Session {
    fn run(self: Box<Self>, ctx: &ConnContext) -> Result<(), DriverError>;
}

/// Serve one connection to completion
///
/// Errors and panics stay inside this call; the connection is closed
/// either way.
pub fn serve(handler: &dyn Handler, ctx: &ConnContext) {
    // No span guard here: it would stay entered across fiber switches.
    let peer = ctx.peer();
    match panic::catch_unwind(AssertUnwindSafe(|| drive(handler, ctx))) {
        Ok(Ok(())) => debug!(%peer, "connection finished"),
        Ok(Err(err)) if err.is_disconnect() => debug!(%peer, %err, "peer went away"),
        Ok(Err(err)) => warn!(%peer, %err, "connection failed"),
        Err(payload) => error!(%peer, panic = %panic_message(&*payload), "handler panicked"),
    }
    ctx.close();
}

fn drive(handler: &dyn Handler, ctx: &ConnContext) -> Result<(), DriverError> {
    let req = match read_request(ctx) {
        Ok(req) => req,
        Err(DriverError::Http(err)) => {
            let resp = match err {
                HttpError::HeadTooLarge(_) | HttpError::BodyTooLarge(_) => Response::new(413),
                HttpError::Incomplete => return Err(err.into()),
                _ => Response::bad_request(),
            };
            ctx.socket().write_all(&resp.to_bytes())?;
            return Err(err.into());
        }
        Err(err) => return Err(err),
    };
    debug!(peer = %ctx.peer(), method = %req.method, path = %req.path, "request");

    let reply = match handler.handle(&req, ctx) {
        Ok(reply) => reply,
        Err(err) => {
            ctx.socket().write_all(&Response::internal_error().to_bytes())?;
            return Err(err);
        }
    };

    match reply {
        Reply::Full(resp) => {
            ctx.socket().write_all(&resp.to_bytes())?;
        }
        Reply::Stream { head, chunks } => {
            ctx.socket().write_all(&head.chunked().to_bytes())?;
            for chunk in chunks {
                let chunk = chunk?;
                if !chunk.is_empty() {
                    ctx.socket().write_all(&http::encode_chunk(&chunk))?;
                }
            }
            ctx.socket().write_all(http::LAST_CHUNK)?;
        }
        Reply::Upgrade { response, session } => {
            ctx.socket().write_all(&response.to_bytes())?;
            session.run(ctx)?;
        }
    }
    Ok(())
}

/// Read one request head and its body
///
/// Bytes past the request stay buffered on the socket for an upgraded
/// session.
pub fn read_request(ctx: &ConnContext) -> Result<Request, DriverError> {
    let sock = ctx.socket();
    loop {
        if let Some(end) = sock.with_buffer(http::find_head_end) {
            let head = sock.take(end);
            let mut req = Request::parse(&head)?;
            let len = req.content_length()?;
            if len > http::MAX_BODY {
                return Err(HttpError::BodyTooLarge(len).into());
            }
            while sock.buffered_len() < len {
                if ctx.fill()? == 0 {
                    return Err(HttpError::Incomplete.into());
                }
            }
            req.body = sock.take(len);
            return Ok(req);
        }
        if sock.buffered_len() >= http::MAX_HEAD {
            return Err(HttpError::HeadTooLarge(http::MAX_HEAD).into());
        }
        if ctx.fill()? == 0 {
            return Err(if sock.buffered_len() == 0 {
                DriverError::PeerClosed
            } else {
                HttpError::Incomplete.into()
            });
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
