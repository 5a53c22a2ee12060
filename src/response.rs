//! Response writing.
//!
//! Every method here queues bytes into the connection's send ring; nothing blocks on the
//! socket. A response is built as a status line (queued implicitly by the first header or body
//! call, using the status set with [`Request::set_status`]), any number of headers, a blank
//! line and the body.
//!
//! ```text
//! set_status(201)            -> (nothing yet)
//! set_type("text/plain")     -> HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\n
//! send(b"done")              -> Content-Length: 4\r\n\r\ndone
//! ```
//!
//! [`Request::send_chunk`] produces a chunked body instead, terminated by an empty chunk.

use alloc::boxed::Box;

use crate::ascii::{AsciiInt, CRLF};
use crate::error::HttpError;
use crate::fs;
use crate::header::{
    RESP_HEAD_CACHE_CONTROL, RESP_HEAD_CONTENT_ENCODING, RESP_HEAD_CONTENT_LENGTH,
    RESP_HEAD_CONTENT_TYPE, RESP_HEAD_TRANSFER_ENCODING, RESP_HEAD_WWW_AUTHENTICATE,
};
use crate::request::{Provider, Request};

const HTTP_PROTO: &[u8] = b"HTTP/1.1 ";
const HEADER_SEP: &[u8] = b": ";
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
const CACHE_ONE_DAY: &str = "public, max-age=86400";

/// Room kept in front of provider data for the chunk size line.
pub(crate) const CHUNK_HEADER_RESERVE: usize = 8;
/// Room kept for the chunk size line and the trailing CRLF.
pub(crate) const CHUNK_RESERVE: usize = CHUNK_HEADER_RESERVE + 2;

/// An HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusCode(pub u16);

#[allow(missing_docs)]
impl StatusCode {
    pub const CONTINUE: Self = StatusCode(100);
    pub const SWITCHING_PROTOCOLS: Self = StatusCode(101);
    pub const OK: Self = StatusCode(200);
    pub const CREATED: Self = StatusCode(201);
    pub const NO_CONTENT: Self = StatusCode(204);
    pub const MOVED_PERMANENTLY: Self = StatusCode(301);
    pub const FOUND: Self = StatusCode(302);
    pub const NOT_MODIFIED: Self = StatusCode(304);
    pub const BAD_REQUEST: Self = StatusCode(400);
    pub const UNAUTHORIZED: Self = StatusCode(401);
    pub const FORBIDDEN: Self = StatusCode(403);
    pub const NOT_FOUND: Self = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: Self = StatusCode(405);
    pub const REQUEST_TIMEOUT: Self = StatusCode(408);
    pub const PAYLOAD_TOO_LARGE: Self = StatusCode(413);
    pub const URI_TOO_LONG: Self = StatusCode(414);
    pub const UNSUPPORTED_MEDIA_TYPE: Self = StatusCode(415);
    pub const UPGRADE_REQUIRED: Self = StatusCode(426);
    pub const INTERNAL_SERVER_ERROR: Self = StatusCode(500);
    pub const NOT_IMPLEMENTED: Self = StatusCode(501);
    pub const BAD_GATEWAY: Self = StatusCode(502);
    pub const SERVICE_UNAVAILABLE: Self = StatusCode(503);
}

impl StatusCode {
    /// Reason phrase, `"Unknown"` for codes outside the table.
    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            404 => "Not Found",
            500 => "Internal Server Error",
            100 => "Continue",
            101 => "Switching Protocols",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            426 => "Upgrade Required",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

impl From<u16> for StatusCode {
    fn from(value: u16) -> Self {
        StatusCode(value)
    }
}

fn has_line_break(value: &str) -> bool {
    value.bytes().any(|b| b == b'\r' || b == b'\n')
}

impl Request<'_> {
    fn emit(&mut self, parts: &[&[u8]]) -> Result<(), HttpError> {
        self.io.write_parts(self.slot, parts)
    }

    fn status_line_len(&self) -> usize {
        if self.ctx.response.started {
            return 0;
        }
        let status = StatusCode(self.ctx.response.status);
        let code = AsciiInt::from(status.0 as u32);
        HTTP_PROTO.len() + code.as_bytes().len() + 1 + status.reason().len() + CRLF.len()
    }

    fn start(&mut self) -> Result<(), HttpError> {
        if self.ctx.response.started {
            return Ok(());
        }

        let status = StatusCode(self.ctx.response.status);
        let code = AsciiInt::from(status.0 as u32);
        self.emit(&[
            HTTP_PROTO,
            code.as_bytes(),
            b" ",
            status.reason().as_bytes(),
            CRLF,
        ])?;
        self.ctx.response.started = true;
        Ok(())
    }

    /// Whether any part of the response has been queued.
    pub fn response_started(&self) -> bool {
        self.ctx.response.started
    }

    /// Whether the response is complete.
    pub fn response_ended(&self) -> bool {
        self.ctx.response.ended
    }

    /// Status code for the response. Has no effect once the status line went out.
    pub fn set_status(&mut self, status: impl Into<StatusCode>) {
        if !self.ctx.response.started {
            self.ctx.response.status = status.into().0;
        }
    }

    /// Status code of the response.
    pub fn status(&self) -> StatusCode {
        StatusCode(self.ctx.response.status)
    }

    /// Queue a response header, preceded by the status line if this is the first.
    pub fn set_header(&mut self, key: &str, value: &str) -> Result<(), HttpError> {
        if self.ctx.response.head_done {
            return Err(HttpError::InvalidArg);
        }
        if key.is_empty() || has_line_break(key) || has_line_break(value) {
            return Err(HttpError::InvalidArg);
        }

        self.start()?;
        self.emit(&[key.as_bytes(), HEADER_SEP, value.as_bytes(), CRLF])
    }

    /// Queue a `Content-Type` header.
    pub fn set_type(&mut self, content_type: &str) -> Result<(), HttpError> {
        self.set_header(RESP_HEAD_CONTENT_TYPE, content_type)
    }

    /// Finish the head and queue `body`. `Content-Length` is added when no header was queued
    /// before, or when `body` is not empty.
    pub fn send(&mut self, body: &[u8]) -> Result<(), HttpError> {
        if self.ctx.response.head_done {
            return Err(HttpError::InvalidArg);
        }

        let fresh = !self.ctx.response.started;
        let len = AsciiInt::from(body.len());
        let with_length = fresh || !body.is_empty();
        let mut total = self.status_line_len() + CRLF.len() + body.len();
        if with_length {
            total += RESP_HEAD_CONTENT_LENGTH.len() + HEADER_SEP.len();
            total += len.as_bytes().len() + CRLF.len();
        }
        // nothing is queued unless the whole response fits
        self.io.reserve(self.slot, total)?;

        self.start()?;
        if with_length {
            self.emit(&[
                RESP_HEAD_CONTENT_LENGTH.as_bytes(),
                HEADER_SEP,
                len.as_bytes(),
                CRLF,
            ])?;
        }
        self.emit(&[CRLF, body])?;

        self.ctx.response.head_done = true;
        self.ctx.response.ended = true;
        Ok(())
    }

    /// [`Request::send`] for text.
    pub fn send_text(&mut self, body: &str) -> Result<(), HttpError> {
        self.send(body.as_bytes())
    }

    /// Queue one chunk of a chunked body. The first call finishes the head with
    /// `Transfer-Encoding: chunked`, an empty chunk ends the body.
    pub fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), HttpError> {
        let state = self.ctx.response;
        if state.ended || (state.head_done && !state.chunked) {
            return Err(HttpError::InvalidArg);
        }

        if !state.head_done {
            self.start()?;
            self.emit(&[
                RESP_HEAD_TRANSFER_ENCODING.as_bytes(),
                HEADER_SEP,
                b"chunked",
                CRLF,
                CRLF,
            ])?;
            self.ctx.response.head_done = true;
            self.ctx.response.chunked = true;
        }

        if chunk.is_empty() {
            self.emit(&[LAST_CHUNK])?;
            self.ctx.response.ended = true;
        } else {
            let len = AsciiInt::hex(chunk.len() as u64);
            self.emit(&[len.as_bytes(), CRLF, chunk, CRLF])?;
        }
        Ok(())
    }

    /// Respond with `status` and a plain text `message`, or the status reason when `None`.
    pub fn send_error(&mut self, status: u16, message: Option<&str>) -> Result<(), HttpError> {
        if self.ctx.response.started {
            return Err(HttpError::InvalidArg);
        }

        self.set_status(status);
        let message = message.unwrap_or(StatusCode(status).reason());
        self.set_type("text/plain")?;
        self.send_text(message)
    }

    /// Respond with a JSON document.
    pub fn send_json(&mut self, json: &str) -> Result<(), HttpError> {
        self.set_type("application/json")?;
        self.send_text(json)
    }

    /// Respond with the file at `path` from the server's file source, or 404 when it cannot be
    /// served. The `.gz` sibling is served with `Content-Encoding: gzip` when the file itself
    /// is missing. The body is streamed from the event loop as the socket drains.
    pub fn send_file(&mut self, path: &str) -> Result<(), HttpError> {
        if self.ctx.response.started {
            return Err(HttpError::InvalidArg);
        }

        let Some(found) = self
            .files
            .as_deref_mut()
            .and_then(|files| fs::resolve(files, path))
        else {
            debug!("file not found");
            return self.send_error(404, Some("File not found"));
        };

        let head = self.file_head(&found);
        if let Err(err) = head {
            self.close_file(found.info.handle);
            return Err(err);
        }

        if found.info.size == 0 {
            self.close_file(found.info.handle);
            return Ok(());
        }

        let previous = self.io.queues[self.slot].start_file(found.info.handle, found.info.size);
        if let Some(previous) = previous {
            self.close_file(previous);
        }
        self.io.pool.mark_write_pending(self.slot);
        Ok(())
    }

    fn file_head(&mut self, found: &fs::ResolvedFile) -> Result<(), HttpError> {
        self.ctx.response.status = 200;
        self.start()?;

        let len = AsciiInt::from(found.info.size);
        self.emit(&[
            RESP_HEAD_CONTENT_TYPE.as_bytes(),
            HEADER_SEP,
            found.mime.as_bytes(),
            CRLF,
            RESP_HEAD_CONTENT_LENGTH.as_bytes(),
            HEADER_SEP,
            len.as_bytes(),
            CRLF,
        ])?;
        if found.gzipped {
            self.emit(&[RESP_HEAD_CONTENT_ENCODING.as_bytes(), HEADER_SEP, b"gzip", CRLF])?;
        }
        if found.cacheable {
            self.emit(&[
                RESP_HEAD_CACHE_CONTROL.as_bytes(),
                HEADER_SEP,
                CACHE_ONE_DAY.as_bytes(),
                CRLF,
            ])?;
        }
        self.emit(&[CRLF])?;

        self.ctx.response.head_done = true;
        self.ctx.response.ended = true;
        Ok(())
    }

    fn close_file(&mut self, handle: fs::FileHandle) {
        if let Some(files) = self.files.as_deref_mut() {
            files.close(handle);
        }
    }

    /// Queue `100 Continue` ahead of the real response.
    pub fn send_continue(&mut self) -> Result<(), HttpError> {
        if self.ctx.response.started {
            return Err(HttpError::InvalidArg);
        }
        self.emit(&[CONTINUE])
    }

    /// Respond with 401 and a Basic authentication challenge for `realm`.
    pub fn send_auth_challenge(&mut self, realm: Option<&str>) -> Result<(), HttpError> {
        let realm = realm.unwrap_or("Restricted");
        if has_line_break(realm) || realm.contains('"') {
            return Err(HttpError::InvalidArg);
        }

        self.set_status(StatusCode::UNAUTHORIZED);
        self.start()?;
        self.emit(&[
            RESP_HEAD_WWW_AUTHENTICATE.as_bytes(),
            HEADER_SEP,
            b"Basic realm=\"",
            realm.as_bytes(),
            b"\"",
            CRLF,
        ])?;
        self.set_type("text/plain")?;
        self.send_text("401 Unauthorized")
    }

    /// Respond with a body pulled from `provider` whenever the socket can take more. With a
    /// known `content_length` the body is sent as is, otherwise it is chunked. `on_complete`
    /// fires once the body has been handed to the socket, or with the error that ended it.
    pub fn send_provider<P, C>(
        &mut self,
        content_length: Option<u32>,
        provider: P,
        on_complete: C,
    ) -> Result<(), HttpError>
    where
        P: FnMut(&mut [u8]) -> Result<usize, HttpError> + 'static,
        C: FnOnce(Result<(), HttpError>) + 'static,
    {
        if self.ctx.response.head_done || self.ctx.provider.is_some() {
            return Err(HttpError::InvalidArg);
        }

        self.start()?;
        match content_length {
            Some(len) => {
                let len = AsciiInt::from(len);
                self.emit(&[
                    RESP_HEAD_CONTENT_LENGTH.as_bytes(),
                    HEADER_SEP,
                    len.as_bytes(),
                    CRLF,
                    CRLF,
                ])?;
            }
            None => self.emit(&[
                RESP_HEAD_TRANSFER_ENCODING.as_bytes(),
                HEADER_SEP,
                b"chunked",
                CRLF,
                CRLF,
            ])?,
        }

        self.ctx.response.head_done = true;
        self.ctx.response.ended = true;
        self.ctx.response.chunked = content_length.is_none();
        self.ctx.provider = Some(Provider {
            source: Box::new(provider),
            on_complete: Some(Box::new(on_complete)),
            chunked: content_length.is_none(),
            eof: false,
        });
        self.io.pool.mark_write_pending(self.slot);
        debug!("provider response started on slot {}", self.slot);
        Ok(())
    }
}

/// Space a provider needs in the ring before it is asked for more data.
pub(crate) fn provider_reserve(provider: &Provider) -> usize {
    if provider.chunked { CHUNK_RESERVE } else { 0 }
}

/// Fill `span`, which must be longer than [`provider_reserve`], from `provider`, framing the
/// data as one chunk when the body is chunked. Returns the number of bytes to commit, 0 at the
/// end of the body, or the provider's error.
pub(crate) fn fill_from_provider(
    provider: &mut Provider,
    span: &mut [u8],
) -> Result<usize, HttpError> {
    if !provider.chunked {
        let max = span.len();
        return (provider.source)(span).map(|n| n.min(max));
    }

    let max = span.len().saturating_sub(CHUNK_RESERVE);
    let n = (provider.source)(&mut span[CHUNK_HEADER_RESERVE..CHUNK_HEADER_RESERVE + max])?;
    let n = n.min(max);
    if n == 0 {
        return Ok(0);
    }

    let size = AsciiInt::hex(n as u64);
    let head = size.as_bytes().len() + CRLF.len();
    span[..size.as_bytes().len()].copy_from_slice(size.as_bytes());
    span[size.as_bytes().len()..head].copy_from_slice(CRLF);
    span.copy_within(CHUNK_HEADER_RESERVE..CHUNK_HEADER_RESERVE + n, head);
    span[head + n..head + n + 2].copy_from_slice(CRLF);
    Ok(head + n + 2)
}

/// Terminator queued after the last provider chunk.
pub(crate) const PROVIDER_LAST_CHUNK: &[u8] = LAST_CHUNK;
