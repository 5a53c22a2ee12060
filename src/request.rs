//! The request handle passed to handlers and middleware.
//!
//! A [`Request`] is a short lived view over the state the server keeps for one connection. It
//! reads the parsed request head, gives access to body bytes that arrived with the head, and
//! (through the methods in [`response`](crate::response)) writes the response into the
//! connection's send ring.
//!
//! Bodies larger than what arrived with the head are taken over with [`Request::defer`]: the
//! body callback then sees each chunk as the event loop reads it, and the done callback fires
//! exactly once when the body is complete, when a callback fails, or when the peer goes away.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::any::Any;

use base64ct::{Base64, Encoding};

use crate::ascii::hex_val;
use crate::config::{BODY_PREFETCH_SIZE, MAX_QUERY_PARAMS};
use crate::connection::Method;
use crate::error::HttpError;
use crate::fs::{FileHandle, FileSource};
use crate::header::{Headers, REQ_HEAD_AUTHORIZATION};
use crate::parser::ParserContext;
use crate::router::Params;
use crate::server::Transport;

/// Receives deferred body chunks.
pub type BodyCallback = Box<dyn FnMut(&mut Request<'_>, &[u8]) -> Result<(), HttpError>>;
/// Fires once when a deferred request ends.
pub type DoneCallback = Box<dyn FnOnce(&mut Request<'_>, Result<(), HttpError>)>;
/// Fills the given buffer with response body bytes, returning how many were written. 0 ends the
/// body.
pub type DataProvider = Box<dyn FnMut(&mut [u8]) -> Result<usize, HttpError>>;
/// Fires once when a provider driven response has been handed to the socket, or failed.
pub type SendCallback = Box<dyn FnOnce(Result<(), HttpError>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResponseState {
    pub(crate) status: u16,
    /// Status line queued.
    pub(crate) started: bool,
    /// Blank line after the headers queued.
    pub(crate) head_done: bool,
    /// Body complete, nothing more may be written.
    pub(crate) ended: bool,
    pub(crate) chunked: bool,
}

impl ResponseState {
    const fn new() -> Self {
        ResponseState {
            status: 200,
            started: false,
            head_done: false,
            ended: false,
            chunked: false,
        }
    }
}

pub(crate) struct Defer {
    pub(crate) on_body: Option<BodyCallback>,
    pub(crate) on_done: Option<DoneCallback>,
    pub(crate) file: Option<FileHandle>,
}

pub(crate) struct Provider {
    pub(crate) source: DataProvider,
    pub(crate) on_complete: Option<SendCallback>,
    pub(crate) chunked: bool,
    pub(crate) eof: bool,
}

/// Per connection request state, owned by the server and lent to [`Request`].
pub(crate) struct RequestContext {
    pub(crate) parser: ParserContext,
    pub(crate) headers: Headers,
    pub(crate) params: Params,
    /// Length of the mount prefix the route was found under.
    pub(crate) base_len: u16,
    /// Body bytes that arrived together with the head.
    pub(crate) body: Vec<u8>,
    pub(crate) body_pos: usize,
    pub(crate) response: ResponseState,
    pub(crate) defer: Option<Defer>,
    pub(crate) provider: Option<Provider>,
    pub(crate) user_data: Option<Box<dyn Any>>,
    /// Canned response written without a send ring, and how much of it went out.
    pub(crate) fallback: Option<(&'static [u8], usize)>,
}

impl RequestContext {
    pub(crate) fn new() -> Self {
        RequestContext {
            parser: ParserContext::new(),
            headers: Headers::new(),
            params: Params::default(),
            base_len: 0,
            body: Vec::with_capacity(BODY_PREFETCH_SIZE),
            body_pos: 0,
            response: ResponseState::new(),
            defer: None,
            provider: None,
            user_data: None,
            fallback: None,
        }
    }

    /// Forget the previous request. Output still draining (provider, fallback) is kept.
    pub(crate) fn reset(&mut self) {
        self.parser.reset();
        self.headers.clear();
        self.params.clear();
        self.base_len = 0;
        self.body.clear();
        self.body_pos = 0;
        self.response = ResponseState::new();
        self.defer = None;
        self.user_data = None;
    }

    /// Forget everything, for a slot being handed to a new connection.
    pub(crate) fn clear(&mut self) {
        self.reset();
        self.provider = None;
        self.fallback = None;
    }
}

/// A request being handled.
pub struct Request<'a> {
    pub(crate) slot: usize,
    pub(crate) io: &'a mut Transport,
    pub(crate) ctx: &'a mut RequestContext,
    pub(crate) files: &'a mut Option<Box<dyn FileSource>>,
}

impl<'a> Request<'a> {
    /// Connection slot serving this request.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Request method. Unrecognised methods are reported as [`Method::Any`].
    pub fn method(&self) -> Method {
        self.io.pool.conn(self.slot).method
    }

    /// The request target as sent, e.g. `/search?q=rust`.
    pub fn uri(&self) -> &str {
        core::str::from_utf8(self.ctx.parser.url()).unwrap_or("")
    }

    /// The request target without its query string.
    pub fn path(&self) -> &str {
        let uri = self.uri();
        uri.split_once('?').map_or(uri, |(path, _)| path)
    }

    /// The part of the target after `?`.
    pub fn query_string(&self) -> Option<&str> {
        self.uri().split_once('?').map(|(_, query)| query)
    }

    /// Raw (still percent encoded) value of query parameter `key`. Only the first
    /// eight parameters are considered. A key without `=` has an empty value.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_string()?
            .split('&')
            .filter(|pair| !pair.is_empty())
            .take(MAX_QUERY_PARAMS)
            .find_map(|pair| {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                (k == key).then_some(v)
            })
    }

    /// Value of route parameter `name`, e.g. `id` for a route registered as `/users/:id`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.ctx.params.get(name, self.uri())
    }

    /// Route parameters in capture order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ctx.params.iter(self.uri())
    }

    /// The mount prefix the matched router was registered under, empty for the root router.
    pub fn base_url(&self) -> &str {
        let uri = self.uri();
        uri.get(..self.ctx.base_len as usize).unwrap_or("")
    }

    /// Value of header `name`, compared case insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.ctx.headers.get(name)
    }

    /// All stored headers in arrival order.
    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.ctx.headers.iter()
    }

    /// Declared body length.
    pub fn content_length(&self) -> u32 {
        self.io.pool.conn(self.slot).content_length
    }

    /// Whether the connection stays open after this request.
    pub fn keep_alive(&self) -> bool {
        self.io.pool.conn(self.slot).http.keep_alive
    }

    /// Whether the request asked for a WebSocket upgrade.
    pub fn is_websocket(&self) -> bool {
        let http = self.io.pool.conn(self.slot).http;
        http.is_websocket && http.upgrade_ws
    }

    /// Copy body bytes that arrived with the request head into `buf`. Returns 0 once they are
    /// used up. Use [`Request::defer`] for anything larger.
    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let available = &self.ctx.body[self.ctx.body_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.ctx.body_pos += n;
        n
    }

    /// Whether `Authorization: Basic` credentials match `user` and `password`.
    pub fn check_basic_auth(&self, user: &str, password: &str) -> bool {
        let Some(encoded) = self
            .header(REQ_HEAD_AUTHORIZATION)
            .and_then(|value| value.strip_prefix("Basic "))
        else {
            return false;
        };

        let mut buf = [0u8; 192];
        let Ok(decoded) = Base64::decode(encoded.trim(), &mut buf) else {
            return false;
        };
        let Some(colon) = decoded.iter().position(|b| *b == b':') else {
            return false;
        };

        &decoded[..colon] == user.as_bytes() && &decoded[colon + 1..] == password.as_bytes()
    }

    /// Data attached with [`Request::set_user_data`], if it is a `T`.
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.ctx.user_data.as_deref()?.downcast_ref()
    }

    /// Mutable access to the attached data.
    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.ctx.user_data.as_deref_mut()?.downcast_mut()
    }

    /// Attach data to this request, typically from middleware for a later handler. Dropped when
    /// the request ends.
    pub fn set_user_data<T: Any>(&mut self, data: T) {
        self.ctx.user_data = Some(Box::new(data));
    }

    /// Take over the request body. `on_body` sees every chunk, starting with bytes that arrived
    /// with the head, and `on_done` fires once at the end. The response may be sent from either
    /// callback; the connection is not reused before `on_done` ran.
    pub fn defer<B, D>(&mut self, on_body: B, on_done: D) -> Result<(), HttpError>
    where
        B: FnMut(&mut Request<'_>, &[u8]) -> Result<(), HttpError> + 'static,
        D: FnOnce(&mut Request<'_>, Result<(), HttpError>) + 'static,
    {
        self.start_defer(Defer {
            on_body: Some(Box::new(on_body)),
            on_done: Some(Box::new(on_done)),
            file: None,
        })
    }

    /// Write the request body to `path` through the server's file source, then call `on_done`.
    pub fn defer_to_file<D>(&mut self, path: &str, on_done: D) -> Result<(), HttpError>
    where
        D: FnOnce(&mut Request<'_>, Result<(), HttpError>) + 'static,
    {
        if self.ctx.defer.is_some() {
            return Err(HttpError::InvalidArg);
        }
        let files = self.files.as_deref_mut().ok_or(HttpError::Io)?;
        let file = files.create(path)?;
        info!("deferring body to file");

        self.start_defer(Defer {
            on_body: None,
            on_done: Some(Box::new(on_done)),
            file: Some(file),
        })
    }

    /// Stop reading the body until [`Request::defer_resume`].
    pub fn defer_pause(&mut self) -> Result<(), HttpError> {
        if self.ctx.defer.is_none() {
            return Err(HttpError::InvalidArg);
        }
        self.io.pool.conn_mut(self.slot).http.defer_paused = true;
        Ok(())
    }

    /// Continue reading a paused body.
    pub fn defer_resume(&mut self) -> Result<(), HttpError> {
        if self.ctx.defer.is_none() {
            return Err(HttpError::InvalidArg);
        }
        self.io.pool.conn_mut(self.slot).http.defer_paused = false;
        Ok(())
    }

    /// Whether the body has been taken over and is not finished yet.
    pub fn is_deferred(&self) -> bool {
        self.ctx.defer.is_some()
    }

    fn start_defer(&mut self, defer: Defer) -> Result<(), HttpError> {
        if self.ctx.defer.is_some() {
            return Err(HttpError::InvalidArg);
        }

        let http = &mut self.io.pool.conn_mut(self.slot).http;
        http.deferred = true;
        http.defer_paused = false;
        self.ctx.defer = Some(defer);
        debug!("request on slot {} deferred", self.slot);

        if self.ctx.body_pos < self.ctx.body.len() {
            let body = core::mem::take(&mut self.ctx.body);
            let res = self.deliver_body(&body[self.ctx.body_pos..]);
            self.ctx.body_pos = body.len();
            self.ctx.body = body;
            if let Err(err) = res {
                self.finish_defer(Err(err));
                return Err(err);
            }
        }

        if self.io.pool.conn(self.slot).body_complete() {
            self.finish_defer(Ok(()));
        }
        Ok(())
    }

    /// Hand `data` to the deferred reader.
    pub(crate) fn deliver_body(&mut self, data: &[u8]) -> Result<(), HttpError> {
        let Some(mut defer) = self.ctx.defer.take() else {
            return Ok(());
        };

        let res = match (defer.file, defer.on_body.as_mut()) {
            (Some(file), _) => self.write_file(file, data),
            (None, Some(on_body)) => on_body(&mut *self, data),
            (None, None) => Ok(()),
        };

        if self.ctx.defer.is_none() {
            self.ctx.defer = Some(defer);
        }
        res
    }

    fn write_file(&mut self, file: FileHandle, mut data: &[u8]) -> Result<(), HttpError> {
        let files = self.files.as_deref_mut().ok_or(HttpError::Io)?;
        while !data.is_empty() {
            match files.write(file, data)? {
                0 => return Err(HttpError::Io),
                n => data = &data[n..],
            }
        }
        Ok(())
    }

    /// End the deferred reader, calling its done callback with `result`.
    pub(crate) fn finish_defer(&mut self, result: Result<(), HttpError>) {
        let Some(mut defer) = self.ctx.defer.take() else {
            return;
        };

        let http = &mut self.io.pool.conn_mut(self.slot).http;
        http.deferred = false;
        http.defer_paused = false;

        if let (Some(file), Some(files)) = (defer.file, self.files.as_deref_mut()) {
            files.close(file);
        }
        if let Some(on_done) = defer.on_done.take() {
            on_done(&mut *self, result);
        }
    }
}

/// Percent decode `src` into `dst`, turning `+` into a space. Malformed escapes are copied as
/// is. Returns the number of bytes written, which stops short when `dst` is full.
pub fn url_decode(src: &str, dst: &mut [u8]) -> usize {
    let src = src.as_bytes();
    let mut i = 0;
    let mut n = 0;

    while i < src.len() && n < dst.len() {
        let hi = src.get(i + 1).copied().and_then(hex_val);
        let lo = src.get(i + 2).copied().and_then(hex_val);
        dst[n] = match (src[i], hi, lo) {
            (b'%', Some(hi), Some(lo)) => {
                i += 3;
                (hi << 4) | lo
            }
            (b'+', _, _) => {
                i += 1;
                b' '
            }
            (b, _, _) => {
                i += 1;
                b
            }
        };
        n += 1;
    }

    n
}
