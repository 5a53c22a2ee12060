//! The server: routing, request dispatch and WebSocket sessions on top of the
//! [`EventLoop`].
//!
//! A [`Server`] owns a root [`Router`], any number of routers mounted under a path prefix,
//! global middleware and error handlers, an optional [`FileSource`] and the per connection
//! state. Each complete request head is routed and handed to the handler through the middleware
//! chain (global, then router, then route). Upgrade requests that match a WebSocket route are
//! answered with `101 Switching Protocols` and their frames are delivered as [`WsEvent`]s from
//! then on.
//!
//! ```
//! use evhttpd::config::Config;
//! use evhttpd::error::HttpError;
//! use evhttpd::request::Request;
//! use evhttpd::server::{Server, WebSocket, WsEvent};
//! # use evhttpd::connection::RawFd;
//! # use evhttpd::event_loop::{Interest, Network, Readiness};
//! # struct Net;
//! # impl embedded_io_async::ErrorType for Net { type Error = embedded_io_async::ErrorKind; }
//! # impl Network for Net {
//! #     fn listen(&mut self, _: &Config) -> Result<(), Self::Error> { Ok(()) }
//! #     fn accept(&mut self, _: bool) -> Result<Option<RawFd>, Self::Error> { Ok(None) }
//! #     async fn wait(&mut self, _: &Interest<'_>, _: u32) -> Result<Readiness, Self::Error> {
//! #         Ok(Readiness::default())
//! #     }
//! #     async fn recv(&mut self, _: RawFd, _: &mut [u8]) -> Result<usize, Self::Error> { Ok(0) }
//! #     async fn send(&mut self, _: RawFd, d: &[u8]) -> Result<usize, Self::Error> { Ok(d.len()) }
//! #     fn close(&mut self, _: RawFd) {}
//! # }
//!
//! # fn main() -> Result<(), HttpError> {
//! let mut server = Server::new(Net, Config::default().with_port(8080));
//! server
//!     .get("/hello/:name", |req: &mut Request<'_>| -> Result<(), HttpError> {
//!         let greeting = match req.param("name") {
//!             Some("world") => "hello, world",
//!             _ => "hello, stranger",
//!         };
//!         req.send_text(greeting)
//!     })?
//!     .websocket("/echo", |ws: &mut WebSocket<'_>, event: WsEvent<'_>| {
//!         if let WsEvent::Message { data, frame_type, .. } = event {
//!             let _ = ws.send(frame_type, data);
//!         }
//!     })?;
//! # Ok(())
//! # }
//! ```

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::any::Any;
use core::cell::Cell;

use arrayvec::ArrayVec;

use crate::channels::Channels;
use crate::config::{Config, MAX_CONNECTIONS, MAX_TOTAL_MIDDLEWARE};
use crate::connection::{ConnState, ConnectionPool, Method, SlotIter};
use crate::error::{Error, HttpError};
use crate::event_loop::{EventHandler, EventLoop, Network};
use crate::fs::{FileHandle, FileSource};
use crate::header::RESP_HEAD_SEC_WEBSOCKET_ACCEPT;
use crate::parser::ParseStatus;
use crate::request::{Request, RequestContext};
use crate::response::{PROVIDER_LAST_CHUNK, fill_from_provider, provider_reserve};
use crate::router::{ErrorHandler, Handler, Match, Middleware, Next, Router, Target, WsHandler};
use crate::send_buffer::{SendBuffer, SendBufferPool};
use crate::websocket::{
    FrameContext, FrameResult, FrameSink, MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER, Opcode,
    WebsocketError, accept_key, close_payload, encode_header,
};

const SWITCHING_PROTOCOLS: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n";
const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
    Content-Length: 19\r\nConnection: close\r\n\r\nService Unavailable";

/// Send rings and the connection pool. Everything that writes to a connection goes through
/// here.
pub(crate) struct Transport {
    pub(crate) pool: ConnectionPool,
    buffers: SendBufferPool,
    pub(crate) queues: [SendBuffer; MAX_CONNECTIONS],
    max_spill: usize,
}

impl Transport {
    fn new(max_spill: usize) -> Self {
        Transport {
            pool: ConnectionPool::new(),
            buffers: SendBufferPool::new(),
            queues: [const { SendBuffer::new() }; MAX_CONNECTIONS],
            max_spill,
        }
    }

    fn ensure_buffer(&mut self, slot: usize) -> Result<(), HttpError> {
        let queue = &mut self.queues[slot];
        if queue.is_allocated() {
            return Ok(());
        }

        if queue.alloc(&mut self.buffers).is_err() {
            warn!("no free send buffer for slot {}", slot);
            return Err(HttpError::NoMem);
        }
        self.pool.conn_mut(slot).pool_index = queue.slot();
        Ok(())
    }

    /// Queue `data` for `slot`. What does not fit in the ring waits in its spill area, up to
    /// the configured cap.
    pub(crate) fn write(&mut self, slot: usize, data: &[u8]) -> Result<(), HttpError> {
        self.write_parts(slot, &[data])
    }

    /// Queue the concatenation of `parts` for `slot`, all or nothing.
    pub(crate) fn write_parts(&mut self, slot: usize, parts: &[&[u8]]) -> Result<(), HttpError> {
        if parts.iter().all(|p| p.is_empty()) {
            return Ok(());
        }

        self.ensure_buffer(slot)?;
        if self.queues[slot].enqueue_parts(parts, self.max_spill).is_err() {
            debug!("output for slot {} exceeds its send budget", slot);
            return Err(HttpError::NoMem);
        }
        self.pool.mark_write_pending(slot);
        Ok(())
    }

    /// Fail with [`HttpError::NoMem`] unless `len` more bytes can be queued for `slot`.
    pub(crate) fn reserve(&mut self, slot: usize, len: usize) -> Result<(), HttpError> {
        self.ensure_buffer(slot)?;
        if self.queues[slot].room(self.max_spill) < len {
            debug!("{} bytes for slot {} exceed its send budget", len, slot);
            return Err(HttpError::NoMem);
        }
        Ok(())
    }

    /// Queue one unmasked frame. With `drop_if_full` the frame is queued whole or not at all.
    fn queue_frame(
        &mut self,
        slot: usize,
        opcode: Opcode,
        payload: &[u8],
        drop_if_full: bool,
    ) -> Result<(), HttpError> {
        let mut head = [0u8; MAX_FRAME_HEADER];
        let n = encode_header(opcode, payload.len(), false, &mut head)?;
        self.ensure_buffer(slot)?;

        let queue = &mut self.queues[slot];
        let frame: [&[u8]; 2] = [&head[..n], payload];
        if drop_if_full {
            queue.queue_parts(&frame)?;
        } else {
            queue.enqueue_parts(&frame, self.max_spill)?;
        }
        self.pool.mark_write_pending(slot);
        Ok(())
    }

    /// Queue a frame to every slot in `mask`, returning how many took it.
    fn broadcast(&mut self, mask: u32, opcode: Opcode, payload: &[u8]) -> usize {
        SlotIter::new(mask)
            .filter(|&slot| self.queue_frame(slot, opcode, payload, true).is_ok())
            .count()
    }

    /// Close `slot` once its queued output is written.
    pub(crate) fn close_after_flush(&mut self, slot: usize) {
        let state = if self.pool.is_write_pending(slot) {
            ConnState::Closing
        } else {
            ConnState::Closed
        };
        self.pool.set_state(slot, state);
    }

    fn release(&mut self, slot: usize) -> Option<FileHandle> {
        self.pool.conn_mut(slot).pool_index = None;
        self.queues[slot].free(&mut self.buffers)
    }
}

/// Holds the one control frame reply (PONG or CLOSE) a call to [`FrameContext::process`] can
/// produce, until the framer has let go of the connection.
#[derive(Default)]
struct PendingReply(Option<(Opcode, ArrayVec<u8, MAX_CONTROL_PAYLOAD>)>);

impl FrameSink for PendingReply {
    fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WebsocketError> {
        let mut buf = ArrayVec::new();
        buf.try_extend_from_slice(payload)
            .map_err(|_| WebsocketError::ControlFrameTooLarge)?;
        self.0 = Some((opcode, buf));
        Ok(())
    }
}

/// Something that happened on an upgraded connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WsEvent<'a> {
    /// The handshake completed.
    Connect,
    /// The connection is going away. Nothing more can be sent on it.
    Disconnect,
    /// A data frame arrived.
    Message {
        /// Unmasked payload.
        data: &'a [u8],
        /// Text, binary, or continuation of a fragmented message.
        frame_type: Opcode,
        /// Last frame of the message.
        fin: bool,
    },
    /// The peer sent something the framer rejected. The connection is closed afterwards.
    Error(WebsocketError),
}

/// An upgraded connection, as seen by a [`WsHandler`].
pub struct WebSocket<'a> {
    slot: usize,
    io: &'a mut Transport,
    channels: &'a mut Channels,
    user_data: &'a mut Option<Box<dyn Any>>,
}

impl WebSocket<'_> {
    /// Connection slot, stable for the lifetime of the connection.
    pub fn id(&self) -> usize {
        self.slot
    }

    /// Whether frames can still be sent.
    pub fn is_connected(&self) -> bool {
        self.io.pool.is_ws_active(self.slot)
    }

    /// Queue a frame. Continuation frames are refused.
    pub fn send(&mut self, opcode: Opcode, data: &[u8]) -> Result<(), HttpError> {
        if opcode == Opcode::Continuation {
            return Err(HttpError::InvalidArg);
        }
        if !self.is_connected() {
            return Err(HttpError::ConnClosed);
        }
        self.io.queue_frame(self.slot, opcode, data, false)
    }

    /// Queue a text frame.
    pub fn send_text(&mut self, text: &str) -> Result<(), HttpError> {
        self.send(Opcode::Text, text.as_bytes())
    }

    /// Queue a binary frame.
    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), HttpError> {
        self.send(Opcode::Binary, data)
    }

    /// Send CLOSE with `code` and `reason` (0 for an empty payload) and close the connection
    /// once it has been written.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<(), HttpError> {
        if !self.is_connected() {
            return Err(HttpError::ConnClosed);
        }

        let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
        let n = close_payload(code, reason, &mut payload);
        let res = self.io.queue_frame(self.slot, Opcode::Close, &payload[..n], false);
        self.io.close_after_flush(self.slot);
        res
    }

    /// Queue a text or binary frame to every WebSocket connection, this one included. Returns
    /// the number of connections that took it.
    pub fn broadcast(&mut self, opcode: Opcode, data: &[u8]) -> usize {
        if !matches!(opcode, Opcode::Text | Opcode::Binary) {
            return 0;
        }
        let mask = self.io.pool.ws_active_mask();
        self.io.broadcast(mask, opcode, data)
    }

    /// Number of WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.io.pool.count_ws_active() as usize
    }

    /// Subscribe to `channel`.
    pub fn join(&mut self, channel: &str) -> Result<(), HttpError> {
        self.channels.join(self.slot, channel)
    }

    /// Unsubscribe from `channel`.
    pub fn leave(&mut self, channel: &str) -> Result<(), HttpError> {
        self.channels.leave(self.slot, channel)
    }

    /// Unsubscribe from every channel.
    pub fn leave_all(&mut self) {
        self.channels.leave_all(self.slot)
    }

    /// Whether this connection is subscribed to `channel`.
    pub fn in_channel(&self, channel: &str) -> bool {
        self.channels.in_channel(self.slot, channel)
    }

    /// Queue a text or binary frame to every subscriber of `channel`. Returns the number of
    /// connections that took it.
    pub fn publish(&mut self, channel: &str, opcode: Opcode, data: &[u8]) -> usize {
        if !matches!(opcode, Opcode::Text | Opcode::Binary) {
            return 0;
        }
        let mask = self.channels.members(channel, self.io.pool.ws_active_mask());
        self.io.broadcast(mask, opcode, data)
    }

    /// Number of connections subscribed to `channel`.
    pub fn channel_size(&self, channel: &str) -> usize {
        self.channels.size(channel, self.io.pool.ws_active_mask())
    }

    /// Channels this connection is subscribed to.
    pub fn channels(&self) -> impl Iterator<Item = &str> + '_ {
        self.channels.channels_of(self.slot)
    }

    /// Data attached with [`WebSocket::set_user_data`], if it is a `T`.
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_deref()?.downcast_ref()
    }

    /// Mutable access to the attached data.
    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_deref_mut()?.downcast_mut()
    }

    /// Attach data to this connection. Dropped when it closes.
    pub fn set_user_data<T: Any>(&mut self, data: T) {
        *self.user_data = Some(Box::new(data));
    }
}

struct WsContext {
    frame: FrameContext,
    handler: Option<Rc<dyn WsHandler>>,
    user_data: Option<Box<dyn Any>>,
}

impl WsContext {
    fn new() -> Self {
        WsContext {
            frame: FrameContext::new(),
            handler: None,
            user_data: None,
        }
    }
}

/// Server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    /// Connections accepted.
    pub total_connections: u32,
    /// Request heads dispatched.
    pub total_requests: u32,
    /// WebSocket data frames received.
    pub total_ws_frames: u32,
}

/// A route found for a request, with where it was found.
struct Routed {
    found: Match,
    base_len: u16,
    mount: Option<usize>,
}

/// Request level [`EventHandler`]: everything the server does with the bytes of a connection.
struct Dispatcher {
    io: Transport,
    requests: Vec<RequestContext>,
    sockets: Vec<WsContext>,
    channels: Channels,
    router: Router,
    mounts: Vec<(String, Router)>,
    middleware: Vec<Rc<dyn Middleware>>,
    error_handler: Option<Rc<dyn ErrorHandler>>,
    files: Option<Box<dyn FileSource>>,
    stats: Stats,
}

impl Dispatcher {
    fn new(max_spill: usize) -> Self {
        Dispatcher {
            io: Transport::new(max_spill),
            requests: (0..MAX_CONNECTIONS).map(|_| RequestContext::new()).collect(),
            sockets: (0..MAX_CONNECTIONS).map(|_| WsContext::new()).collect(),
            channels: Channels::new(),
            router: Router::new(),
            mounts: Vec::new(),
            middleware: Vec::new(),
            error_handler: None,
            files: None,
            stats: Stats::default(),
        }
    }

    fn lookup(&self, method: Method, path: &str, websocket: bool) -> Option<Routed> {
        for (i, (prefix, router)) in self.mounts.iter().enumerate() {
            let Some(rest) = path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if !rest.is_empty() && !rest.starts_with('/') {
                continue;
            }

            let sub = if rest.is_empty() { "/" } else { rest };
            if let Some(mut found) = router.lookup(method, sub, websocket) {
                let base_len = prefix.len() as u16;
                found.params.shift(base_len);
                return Some(Routed {
                    found,
                    base_len,
                    mount: Some(i),
                });
            }
        }

        self.router.lookup(method, path, websocket).map(|found| Routed {
            found,
            base_len: 0,
            mount: None,
        })
    }

    fn router_of(&self, mount: Option<usize>) -> &Router {
        match mount.and_then(|i| self.mounts.get(i)) {
            Some((_, router)) => router,
            None => &self.router,
        }
    }

    fn dispatch(&mut self, slot: usize, status: ParseStatus, rest: &mut [u8]) -> Result<(), Error> {
        self.stats.total_requests = self.stats.total_requests.wrapping_add(1);

        let conn = self.io.pool.conn_mut(slot);
        if status != ParseStatus::Ok {
            conn.content_length = 0;
        }
        let upgrade = conn.state == ConnState::WebSocket;
        let method = conn.method;

        let ctx = &self.requests[slot];
        let Ok(uri) = core::str::from_utf8(ctx.parser.url()) else {
            self.io.pool.set_state(slot, ConnState::HttpHeaders);
            self.fail_request(slot, HttpError::InvalidArg, None);
            self.io.close_after_flush(slot);
            return Ok(());
        };
        let path = uri.split_once('?').map_or(uri, |(path, _)| path);

        if upgrade {
            match self.lookup(method, path, true) {
                Some(Routed {
                    found:
                        Match {
                            target: Target::Ws(handler),
                            ..
                        },
                    ..
                }) => return self.upgrade(slot, handler, rest),
                _ => {
                    debug!("no websocket route, serving slot {} as http", slot);
                    self.io.pool.set_state(slot, ConnState::HttpHeaders);
                }
            }
        }
        let routed = self.lookup(method, path, false);
        self.prefetch_body(slot, rest);

        match routed {
            Some(Routed {
                found:
                    Match {
                        target: Target::Http(handler),
                        route_id,
                        params,
                        middleware,
                    },
                base_len,
                mount,
            }) => {
                let ctx = &mut self.requests[slot];
                ctx.params = params;
                ctx.base_len = base_len;
                self.io.pool.conn_mut(slot).route_id = route_id;
                self.run_handler(slot, &*handler, &middleware, mount);
            }
            _ => {
                debug!("no route for request on slot {}", slot);
                let errors = self.router.error_handler();
                self.fail_request(slot, HttpError::NotFound, errors);
            }
        }

        self.finish_request(slot);
        Ok(())
    }

    fn prefetch_body(&mut self, slot: usize, rest: &[u8]) {
        let conn = self.io.pool.conn_mut(slot);
        let take = rest.len().min(conn.content_length as usize);
        conn.bytes_received = take as u32;

        let ctx = &mut self.requests[slot];
        ctx.body.clear();
        ctx.body.extend_from_slice(&rest[..take]);
        ctx.body_pos = 0;
    }

    fn run_handler(
        &mut self,
        slot: usize,
        handler: &dyn Handler,
        route_middleware: &[Rc<dyn Middleware>],
        mount: Option<usize>,
    ) {
        let router = self.router_of(mount);
        let errors = router.error_handler();

        let mut chain: ArrayVec<Rc<dyn Middleware>, MAX_TOTAL_MIDDLEWARE> = ArrayVec::new();
        let all = self
            .middleware
            .iter()
            .chain(router.router_middleware())
            .chain(route_middleware);
        for mw in all {
            if chain.try_push(mw.clone()).is_err() {
                warn!("middleware limit reached, skipping the rest");
                break;
            }
        }

        let mut req = Request {
            slot,
            io: &mut self.io,
            ctx: &mut self.requests[slot],
            files: &mut self.files,
        };
        if let Err(err) = Next::new(&chain, handler).run(&mut req) {
            self.fail_request(slot, err, errors);
        }
    }

    /// Turn `err` into a response: the router's error handler first, then the server's, then
    /// the status and message of `err` itself.
    fn fail_request(&mut self, slot: usize, err: HttpError, errors: Option<Rc<dyn ErrorHandler>>) {
        debug!("request on slot {} failed: {:?}", slot, err);
        let global = self.error_handler.clone();
        let mut req = Request {
            slot,
            io: &mut self.io,
            ctx: &mut self.requests[slot],
            files: &mut self.files,
        };

        if req.response_started() {
            // a partial response cannot be repaired
            req.io.pool.conn_mut(slot).http.keep_alive = false;
            return;
        }

        for handler in errors.iter().chain(global.iter()) {
            if handler.handle(&err, &mut req).is_ok() {
                return;
            }
            if req.response_started() {
                req.io.pool.conn_mut(slot).http.keep_alive = false;
                return;
            }
        }

        if let Err(send_err) = req.send_error(err.status(), Some(err.message())) {
            debug!("error response on slot {} failed: {:?}", slot, send_err);
            self.io.pool.conn_mut(slot).http.keep_alive = false;
            if !self.io.queues[slot].is_allocated() {
                warn!("sending canned 503 on slot {}", slot);
                self.requests[slot].fallback = Some((SERVICE_UNAVAILABLE, 0));
                self.io.pool.mark_write_pending(slot);
            }
        }
    }

    fn finish_request(&mut self, slot: usize) {
        let conn = self.io.pool.conn_mut(slot);
        if matches!(conn.state, ConnState::Closing | ConnState::Closed) {
            return;
        }

        if conn.http.deferred || !conn.body_complete() {
            // the deferred reader, or the discard path, takes the rest of the body
            conn.state = ConnState::HttpBody;
            return;
        }
        self.complete(slot);
    }

    fn complete(&mut self, slot: usize) {
        let conn = self.io.pool.conn_mut(slot);
        if !conn.http.keep_alive {
            self.io.close_after_flush(slot);
            return;
        }

        conn.reset_request();
        conn.state = ConnState::HttpHeaders;
        self.requests[slot].reset();
    }

    fn upgrade(
        &mut self,
        slot: usize,
        handler: Rc<dyn WsHandler>,
        rest: &mut [u8],
    ) -> Result<(), Error> {
        let key = self.requests[slot]
            .headers
            .ws_key()
            .ok_or(Error::Protocol("missing websocket key"))?;
        let accept = accept_key(key).map_err(|_| Error::Protocol("invalid websocket key"))?;

        let parts: [&[u8]; 5] = [
            SWITCHING_PROTOCOLS,
            RESP_HEAD_SEC_WEBSOCKET_ACCEPT.as_bytes(),
            b": ",
            &accept,
            b"\r\n\r\n",
        ];
        for part in parts {
            self.io
                .write(slot, part)
                .map_err(|_| Error::CapacityExhausted)?;
        }

        self.io.pool.set_state(slot, ConnState::WebSocket);
        self.requests[slot].reset();
        let ws = &mut self.sockets[slot];
        ws.frame.reset();
        ws.handler = Some(handler);
        ws.user_data = None;
        info!("websocket connected on slot {}", slot);

        self.ws_event(slot, WsEvent::Connect);
        if rest.is_empty() || !self.io.pool.is_ws_active(slot) {
            return Ok(());
        }
        self.on_ws_frame(slot, rest)
    }

    fn ws_event(&mut self, slot: usize, event: WsEvent<'static>) {
        let ws = &mut self.sockets[slot];
        let Some(handler) = ws.handler.clone() else {
            return;
        };
        let mut socket = WebSocket {
            slot,
            io: &mut self.io,
            channels: &mut self.channels,
            user_data: &mut ws.user_data,
        };
        handler.on_event(&mut socket, event);
    }

    fn ws_message(&mut self, slot: usize) {
        let fin = self.io.pool.conn(slot).ws.fin;
        let ws = &mut self.sockets[slot];
        let Some(handler) = ws.handler.clone() else {
            return;
        };

        let event = WsEvent::Message {
            data: ws.frame.payload(),
            frame_type: ws.frame.opcode(),
            fin,
        };
        let mut socket = WebSocket {
            slot,
            io: &mut self.io,
            channels: &mut self.channels,
            user_data: &mut ws.user_data,
        };
        handler.on_event(&mut socket, event);
    }

    fn refill_file(&mut self, slot: usize) {
        let queue = &mut self.io.queues[slot];
        let Some(stream) = queue.file() else {
            return;
        };
        let Some(files) = self.files.as_deref_mut() else {
            queue.stop_file();
            return;
        };

        let span = queue.write_ptr();
        if span.is_empty() {
            return;
        }
        let want = span.len().min(stream.remaining as usize);
        match files.read(stream.handle, &mut span[..want]) {
            Ok(n) if n > 0 => {
                queue.commit(n);
                queue.file_consumed(n as u32);
                if queue.file().is_some_and(|f| f.remaining == 0) {
                    queue.stop_file();
                    files.close(stream.handle);
                }
            }
            res => {
                if let Err(err) = res {
                    warn!("file read on slot {} failed: {:?}", slot, err);
                }
                // the body is short of its Content-Length, so the connection cannot be reused
                queue.stop_file();
                files.close(stream.handle);
                self.io.pool.conn_mut(slot).http.keep_alive = false;
                self.io.close_after_flush(slot);
            }
        }
    }

    fn refill_provider(&mut self, slot: usize) {
        let Some(provider) = self.requests[slot].provider.as_mut() else {
            return;
        };
        if provider.eof {
            return;
        }

        let max_spill = self.io.max_spill;
        let queue = &mut self.io.queues[slot];
        let span = queue.write_ptr();
        if span.len() <= provider_reserve(provider) {
            return;
        }

        match fill_from_provider(provider, span) {
            Ok(0) => {
                provider.eof = true;
                if provider.chunked && queue.enqueue(PROVIDER_LAST_CHUNK, max_spill).is_err() {
                    warn!("unable to queue last chunk on slot {}", slot);
                }
            }
            Ok(n) => queue.commit(n),
            Err(err) => {
                debug!("provider on slot {} failed: {:?}", slot, err);
                if let Some(on_complete) = provider.on_complete.take() {
                    on_complete(Err(err));
                }
                self.requests[slot].provider = None;
                self.io.pool.set_state(slot, ConnState::Closed);
            }
        }
    }
}

impl EventHandler for Dispatcher {
    fn pool(&self) -> &ConnectionPool {
        &self.io.pool
    }

    fn pool_mut(&mut self) -> &mut ConnectionPool {
        &mut self.io.pool
    }

    fn on_connect(&mut self, slot: usize) {
        self.stats.total_connections = self.stats.total_connections.wrapping_add(1);
        self.requests[slot].clear();
        self.sockets[slot] = WsContext::new();
    }

    fn on_http_request(&mut self, slot: usize, data: &mut [u8]) -> Result<(), Error> {
        let conn = self.io.pool.conn_mut(slot);
        if conn.state == ConnState::New {
            conn.state = ConnState::HttpHeaders;
        }

        let ctx = &mut self.requests[slot];
        let status = match ctx.parser.parse(conn, &mut ctx.headers, data) {
            Ok(status) => status,
            Err(err) => {
                warn!("bad request on slot {}: {}", slot, err.as_str());
                self.io.pool.set_state(slot, ConnState::HttpHeaders);
                self.fail_request(slot, HttpError::InvalidArg, None);
                self.io.close_after_flush(slot);
                return Ok(());
            }
        };

        match status {
            ParseStatus::NeedMore => Ok(()),
            ParseStatus::Ok | ParseStatus::Complete => {
                let offset = ctx.parser.body_offset().min(data.len());
                self.dispatch(slot, status, &mut data[offset..])
            }
        }
    }

    fn on_http_body(&mut self, slot: usize, data: &mut [u8]) -> Result<(), Error> {
        let conn = self.io.pool.conn_mut(slot);
        let remaining = conn.content_length.saturating_sub(conn.bytes_received) as usize;
        let take = data.len().min(remaining);
        conn.bytes_received += take as u32;
        let complete = conn.body_complete();

        if self.requests[slot].defer.is_some() {
            let mut req = Request {
                slot,
                io: &mut self.io,
                ctx: &mut self.requests[slot],
                files: &mut self.files,
            };

            if let Err(err) = req.deliver_body(&data[..take]) {
                debug!("deferred body on slot {} failed: {:?}", slot, err);
                req.finish_defer(Err(err));
                if !req.response_started() {
                    if let Err(send_err) = req.send_error(err.status(), Some(err.message())) {
                        debug!("error response on slot {} failed: {:?}", slot, send_err);
                    }
                }
                self.io.close_after_flush(slot);
                return Ok(());
            }
            if complete {
                req.finish_defer(Ok(()));
            }
        }

        if complete {
            self.complete(slot);
        }
        Ok(())
    }

    fn on_ws_frame(&mut self, slot: usize, data: &mut [u8]) -> Result<(), Error> {
        let mut offset = 0;
        while offset < data.len() && self.io.pool.is_ws_active(slot) {
            let mut reply = PendingReply::default();
            let res = self.sockets[slot].frame.process(
                self.io.pool.conn_mut(slot),
                &mut data[offset..],
                &mut reply,
            );
            if let Some((opcode, payload)) = reply.0 {
                if self.io.queue_frame(slot, opcode, &payload, false).is_err() {
                    warn!("unable to queue control reply on slot {}", slot);
                }
            }

            let (result, used) = match res {
                Ok(progress) => progress,
                Err(err) => {
                    warn!("websocket error on slot {}: {:?}", slot, err);
                    self.ws_event(slot, WsEvent::Error(err));
                    return Err(Error::Protocol("invalid websocket frame"));
                }
            };
            offset += used;

            match result {
                FrameResult::NeedMore => break,
                FrameResult::Ok => {}
                FrameResult::Complete => {
                    self.stats.total_ws_frames = self.stats.total_ws_frames.wrapping_add(1);
                    self.ws_message(slot);
                }
                FrameResult::Close => {
                    debug!("websocket close on slot {}", slot);
                    self.on_ws_disconnect(slot);
                    self.io.close_after_flush(slot);
                    break;
                }
            }

            if used == 0 {
                break;
            }
        }
        Ok(())
    }

    fn on_ws_disconnect(&mut self, slot: usize) {
        let ws = &mut self.sockets[slot];
        let Some(handler) = ws.handler.take() else {
            return;
        };

        let mut socket = WebSocket {
            slot,
            io: &mut self.io,
            channels: &mut self.channels,
            user_data: &mut ws.user_data,
        };
        handler.on_event(&mut socket, WsEvent::Disconnect);

        self.channels.leave_all(slot);
        ws.user_data = None;
        ws.frame.reset();
        info!("websocket disconnected on slot {}", slot);
    }

    fn on_disconnect(&mut self, slot: usize) {
        if self.requests[slot].defer.is_some() {
            let mut req = Request {
                slot,
                io: &mut self.io,
                ctx: &mut self.requests[slot],
                files: &mut self.files,
            };
            req.finish_defer(Err(HttpError::ConnClosed));
        }
        if let Some(mut provider) = self.requests[slot].provider.take() {
            if let Some(on_complete) = provider.on_complete.take() {
                on_complete(Err(HttpError::ConnClosed));
            }
        }
        self.on_ws_disconnect(slot);

        if let Some(file) = self.io.release(slot) {
            if let Some(files) = self.files.as_deref_mut() {
                files.close(file);
            }
        }
        self.requests[slot].clear();
        debug!("slot {} released", slot);
    }

    fn poll_output(&mut self, slot: usize) -> &[u8] {
        if let Some((canned, sent)) = self.requests[slot].fallback {
            if sent < canned.len() {
                return &canned[sent..];
            }
            self.requests[slot].fallback = None;
        }

        self.io.queues[slot].refill_from_spill();
        self.refill_file(slot);
        self.refill_provider(slot);
        self.io.queues[slot].peek()
    }

    fn consume_output(&mut self, slot: usize, n: usize) {
        if let Some((canned, sent)) = self.requests[slot].fallback.as_mut() {
            *sent = (*sent + n).min(canned.len());
            return;
        }
        self.io.queues[slot].consume(n);
    }

    fn output_drained(&mut self, slot: usize) {
        if self.requests[slot]
            .provider
            .as_ref()
            .is_some_and(|p| !p.eof)
        {
            return;
        }

        self.io.pool.clear_write_pending(slot);
        if let Some(file) = self.io.release(slot) {
            if let Some(files) = self.files.as_deref_mut() {
                files.close(file);
            }
        }
        if let Some(mut provider) = self.requests[slot].provider.take() {
            if let Some(on_complete) = provider.on_complete.take() {
                on_complete(Ok(()));
            }
        }

        if self.io.pool.conn(slot).state == ConnState::Closing {
            self.io.pool.set_state(slot, ConnState::Closed);
        }
    }
}

/// Stops a running [`Server`] from inside a handler, or anywhere else a clone was handed to.
#[derive(Debug, Clone)]
pub struct StopHandle(Rc<Cell<bool>>);

impl StopHandle {
    /// Make [`Server::run`] return after the current iteration.
    pub fn stop(&self) {
        self.0.set(false);
    }
}

/// An HTTP/1.1 and WebSocket server over a [`Network`].
pub struct Server<N: Network> {
    event_loop: EventLoop<N>,
    dispatcher: Dispatcher,
    running: Rc<Cell<bool>>,
}

impl<N: Network> Server<N> {
    /// A server that will listen on `net` as described by `config`.
    pub fn new(net: N, config: Config) -> Self {
        Server {
            dispatcher: Dispatcher::new(config.max_spill),
            event_loop: EventLoop::new(net, config),
            running: Rc::new(Cell::new(false)),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        self.event_loop.config()
    }

    /// The platform network.
    pub fn network(&self) -> &N {
        self.event_loop.network()
    }

    /// The platform network, mutably.
    pub fn network_mut(&mut self) -> &mut N {
        self.event_loop.network_mut()
    }

    /// The root router.
    pub fn router(&mut self) -> &mut Router {
        &mut self.dispatcher.router
    }

    /// Register `handler` for `method` requests to `pattern` on the root router.
    pub fn route<H: Handler + 'static>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
    ) -> Result<&mut Self, HttpError> {
        self.dispatcher.router.route(method, pattern, handler)?;
        Ok(self)
    }

    /// Register `handler` with route specific middleware.
    pub fn route_with<H: Handler + 'static>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
        middleware: &[Rc<dyn Middleware>],
    ) -> Result<&mut Self, HttpError> {
        self.dispatcher
            .router
            .route_with(method, pattern, handler, middleware)?;
        Ok(self)
    }

    /// Register a `GET` handler.
    pub fn get<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::GET, pattern, h)
    }

    /// Register a `POST` handler.
    pub fn post<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::POST, pattern, h)
    }

    /// Register a `PUT` handler.
    pub fn put<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::PUT, pattern, h)
    }

    /// Register a `DELETE` handler.
    pub fn delete<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::DELETE, pattern, h)
    }

    /// Register a `PATCH` handler.
    pub fn patch<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::PATCH, pattern, h)
    }

    /// Register a handler for every method.
    pub fn any<H: Handler + 'static>(&mut self, pattern: &str, h: H) -> Result<&mut Self, HttpError> {
        self.route(Method::Any, pattern, h)
    }

    /// Register a WebSocket handler.
    pub fn websocket<W: WsHandler + 'static>(
        &mut self,
        pattern: &str,
        handler: W,
    ) -> Result<&mut Self, HttpError> {
        self.dispatcher.router.websocket(pattern, handler)?;
        Ok(self)
    }

    /// Add middleware that runs before every routed request, ahead of router middleware.
    pub fn middleware<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.dispatcher.middleware.push(Rc::new(middleware));
        self
    }

    /// Set the error handler tried after the matched router's own.
    pub fn on_error<E: ErrorHandler + 'static>(&mut self, handler: E) -> &mut Self {
        self.dispatcher.error_handler = Some(Rc::new(handler));
        self
    }

    /// Serve `router` under `prefix`, e.g. `/api`. Mounted routers are tried in mount order
    /// before the root router. Route parameters keep referring to the full request path.
    pub fn mount(&mut self, prefix: &str, router: Router) -> Result<&mut Self, HttpError> {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() || !prefix.starts_with('/') {
            return Err(HttpError::InvalidArg);
        }
        if self.dispatcher.mounts.iter().any(|(p, _)| p == prefix) {
            return Err(HttpError::InvalidArg);
        }

        self.dispatcher.mounts.push((prefix.into(), router));
        Ok(self)
    }

    /// Remove the `method` handlers registered on `pattern` in the root router.
    pub fn remove_route(&mut self, method: Method, pattern: &str) -> bool {
        self.dispatcher.router.remove(method, pattern)
    }

    /// Serve files and accept deferred uploads through `files`.
    pub fn set_file_source<F: FileSource + 'static>(&mut self, files: F) {
        self.dispatcher.files = Some(Box::new(files));
    }

    /// A handle that stops [`Server::run`].
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    /// Make [`Server::run`] return after the current iteration.
    pub fn stop(&self) {
        self.running.set(false);
    }

    /// Whether [`Server::run`] is looping.
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Listen and serve until stopped. Every connection is closed before returning. Fails
    /// when the listener cannot be set up or the readiness wait fails.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.event_loop.listen()?;
        self.running.set(true);

        let mut res = Ok(());
        while self.running.get() {
            if let Err(err) = self.event_loop.run_once(&mut self.dispatcher).await {
                error!("event loop failed: {:?}", err);
                res = Err(err);
                break;
            }
        }

        self.running.set(false);
        self.event_loop.close_all(&mut self.dispatcher).await;
        info!("server stopped");
        res
    }

    /// Run a single event loop iteration, listening first if needed. For embedding in a loop
    /// driven elsewhere.
    pub async fn poll_once(&mut self) -> Result<(), Error> {
        self.event_loop.run_once(&mut self.dispatcher).await
    }

    /// Counters since the server was created.
    pub fn stats(&self) -> Stats {
        self.dispatcher.stats
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.dispatcher.io.pool.count_active() as usize
    }

    /// Number of WebSocket connections.
    pub fn ws_connection_count(&self) -> usize {
        self.dispatcher.io.pool.count_ws_active() as usize
    }

    /// Queue a text or binary frame to every WebSocket connection. Returns how many took it.
    pub fn broadcast(&mut self, opcode: Opcode, data: &[u8]) -> usize {
        if !matches!(opcode, Opcode::Text | Opcode::Binary) {
            return 0;
        }
        let io = &mut self.dispatcher.io;
        let mask = io.pool.ws_active_mask();
        io.broadcast(mask, opcode, data)
    }

    /// Queue a text or binary frame to the subscribers of `channel`. Returns how many took it.
    pub fn publish(&mut self, channel: &str, opcode: Opcode, data: &[u8]) -> usize {
        if !matches!(opcode, Opcode::Text | Opcode::Binary) {
            return 0;
        }
        let io = &mut self.dispatcher.io;
        let mask = self
            .dispatcher
            .channels
            .members(channel, io.pool.ws_active_mask());
        io.broadcast(mask, opcode, data)
    }

    /// Number of WebSocket connections subscribed to `channel`.
    pub fn channel_size(&self, channel: &str) -> usize {
        let mask = self.dispatcher.io.pool.ws_active_mask();
        self.dispatcher.channels.size(channel, mask)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::RefCell;
    use std::format;
    use std::string::String;
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::connection::RawFd;
    use crate::event_loop::tests::MockNet;
    use crate::fs::tests::MemFs;

    const WS_UPGRADE: &[u8] = b"GET /ws HTTP/1.1\r\n\
        Host: x\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";
    const WS_ACCEPTED: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

    fn server() -> Server<MockNet> {
        Server::new(MockNet::default(), Config::default())
    }

    async fn poll(server: &mut Server<MockNet>, times: usize) {
        for _ in 0..times {
            server.poll_once().await.unwrap();
        }
    }

    async fn connect(server: &mut Server<MockNet>) -> RawFd {
        let fd = server.network_mut().connect();
        poll(server, 1).await;
        fd
    }

    async fn exchange(server: &mut Server<MockNet>, fd: RawFd, data: &[u8]) -> Vec<u8> {
        server.network_mut().push(fd, data);
        poll(server, 3).await;
        server.network_mut().take_output(fd)
    }

    fn masked(first: u8, payload: &[u8]) -> Vec<u8> {
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut out = vec![first, 0x80 | payload.len() as u8];
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    fn as_text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_keep_alive() {
        let mut server = server();
        server
            .get("/hello", |req: &mut Request<'_>| req.send_text("hello"))
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");

        // same connection, second request
        let out = exchange(&mut server, fd, b"GET /hello HTTP/1.1\r\n\r\n").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        assert!(!server.network().is_closed(fd));
        assert_eq!(server.connection_count(), 1);

        let stats = server.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.total_requests, 2);
    }

    #[tokio::test]
    async fn test_connection_close() {
        let mut server = server();
        server
            .get("/", |req: &mut Request<'_>| req.send_text("bye"))
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nbye");
        assert!(server.network().is_closed(fd));
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_request_split_across_reads() {
        let mut server = server();
        server
            .get("/split", |req: &mut Request<'_>| req.send_text("whole"))
            .unwrap();
        let fd = connect(&mut server).await;

        server.network_mut().push(fd, b"GET /sp");
        server.network_mut().push(fd, b"lit HTTP/1.1\r\nHo");
        let out = exchange(&mut server, fd, b"st: x\r\n\r\n").await;
        assert!(out.is_empty(), "head still incomplete");
        poll(&mut server, 3).await;
        assert_eq!(
            server.network_mut().take_output(fd),
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nwhole"
        );
    }

    #[tokio::test]
    async fn test_not_found_and_bad_request() {
        let mut server = server();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /nope HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            out,
            b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found"
        );

        let out = exchange(&mut server, fd, b" GET / HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            out,
            b"HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\nBad Request"
        );
        assert!(server.network().is_closed(fd));
    }

    #[tokio::test]
    async fn test_params_and_query() {
        let mut server = server();
        server
            .get("/users/:id", |req: &mut Request<'_>| {
                let body = format!(
                    "{} {}",
                    req.param("id").unwrap_or("-"),
                    req.query("tab").unwrap_or("-")
                );
                req.send_text(&body)
            })
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /users/42?tab=posts HTTP/1.1\r\n\r\n").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\n42 posts");

        let out = exchange(&mut server, fd, b"GET /users/7?&raw&tab= HTTP/1.1\r\n\r\n").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n7 ");

        let out = exchange(&mut server, fd, b"GET /users/7?other=1 HTTP/1.1\r\n\r\n").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n7 -");
    }

    #[tokio::test]
    async fn test_middleware_order_and_short_circuit() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut server = server();

        let log = seen.clone();
        server.middleware(move |req: &mut Request<'_>, next: Next<'_>| {
            log.borrow_mut().push("global");
            next.run(req)
        });

        let log = seen.clone();
        server.router().middleware(move |req: &mut Request<'_>, next: Next<'_>| {
            log.borrow_mut().push("router");
            if req.header("Authorization").is_none() {
                return req.send_auth_challenge(None);
            }
            next.run(req)
        });

        let log = seen.clone();
        server
            .get("/private", move |req: &mut Request<'_>| {
                log.borrow_mut().push("handler");
                req.send_text("secret")
            })
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /private HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            as_text(out),
            "HTTP/1.1 401 Unauthorized\r\n\
                 WWW-Authenticate: Basic realm=\"Restricted\"\r\n\
                 Content-Type: text/plain\r\n\
                 Content-Length: 16\r\n\r\n\
                 401 Unauthorized"
        );
        assert_eq!(*seen.borrow(), ["global", "router"]);

        seen.borrow_mut().clear();
        let out = exchange(
            &mut server,
            fd,
            b"GET /private HTTP/1.1\r\nAuthorization: Basic dTpw\r\n\r\n",
        )
        .await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret");
        assert_eq!(*seen.borrow(), ["global", "router", "handler"]);
    }

    #[tokio::test]
    async fn test_basic_auth_and_user_data() {
        let mut server = server();
        server.middleware(|req: &mut Request<'_>, next: Next<'_>| {
            if !req.check_basic_auth("admin", "secret") {
                return Err(HttpError::Status(403));
            }
            req.set_user_data(7u32);
            next.run(req)
        });
        server
            .get("/admin", |req: &mut Request<'_>| {
                let body = format!("user {}", req.user_data::<u32>().copied().unwrap_or(0));
                req.send_text(&body)
            })
            .unwrap();
        let fd = connect(&mut server).await;

        // admin:secret
        let out = exchange(
            &mut server,
            fd,
            b"GET /admin HTTP/1.1\r\nauthorization: Basic YWRtaW46c2VjcmV0\r\n\r\n",
        )
        .await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nuser 7");

        let out = exchange(
            &mut server,
            fd,
            b"GET /admin HTTP/1.1\r\nAuthorization: Basic YWRtaW46d3Jvbmc=\r\n\r\n",
        )
        .await;
        assert_eq!(
            out,
            b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nForbidden"
        );
    }

    #[tokio::test]
    async fn test_error_handlers() {
        let mut server = server();
        server
            .get("/fail", |_req: &mut Request<'_>| -> Result<(), HttpError> {
                Err(HttpError::InvalidArg)
            })
            .unwrap()
            .get("/teapot", |_req: &mut Request<'_>| -> Result<(), HttpError> {
                Err(HttpError::Status(418))
            })
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /fail HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            out,
            b"HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\nBad Request"
        );

        server.on_error(|err: &HttpError, req: &mut Request<'_>| match err {
            HttpError::Status(418) => {
                req.set_status(418);
                req.send_text("short and stout")
            }
            _ => Err(*err),
        });
        let out = exchange(&mut server, fd, b"GET /teapot HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            out,
            b"HTTP/1.1 418 Unknown\r\nContent-Length: 15\r\n\r\nshort and stout"
        );

        // declined by the handler, so the default mapping applies
        let out = exchange(&mut server, fd, b"GET /fail HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_mounted_router() {
        let mut api = Router::new();
        api.get("/items/:id", |req: &mut Request<'_>| {
            let body = format!("{} {}", req.base_url(), req.param("id").unwrap_or("-"));
            req.send_text(&body)
        })
        .unwrap();
        api.on_error(|_err: &HttpError, req: &mut Request<'_>| req.send_json("{}"));

        let mut server = server();
        server.mount("/api", api).unwrap();
        assert_eq!(server.mount("/api/", Router::new()).err(), Some(HttpError::InvalidArg));
        assert_eq!(server.mount("", Router::new()).err(), Some(HttpError::InvalidArg));
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /api/items/7 HTTP/1.1\r\n\r\n").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\n/api 7");

        let out = exchange(&mut server, fd, b"GET /apiary HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn test_body_prefetch() {
        let mut server = server();
        server
            .post("/echo", |req: &mut Request<'_>| {
                let mut buf = [0u8; 16];
                let n = req.recv(&mut buf);
                req.send(&buf[..n])
            })
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(
            &mut server,
            fd,
            b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
    }

    #[tokio::test]
    async fn test_unread_body_is_discarded() {
        let mut server = server();
        server
            .post("/ignore", |req: &mut Request<'_>| req.send_text("ok"))
            .unwrap()
            .get("/next", |req: &mut Request<'_>| req.send_text("next"))
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(
            &mut server,
            fd,
            b"POST /ignore HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123",
        )
        .await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        server.network_mut().push(fd, b"456789");
        let out = exchange(&mut server, fd, b"GET /next HTTP/1.1\r\n\r\n").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nnext");
    }

    #[tokio::test]
    async fn test_deferred_body() {
        let body = Rc::new(RefCell::new(Vec::new()));
        let mut server = server();
        let sink = body.clone();
        server
            .post("/upload", move |req: &mut Request<'_>| {
                let sink = sink.clone();
                req.defer(
                    move |_req: &mut Request<'_>, data: &[u8]| {
                        sink.borrow_mut().extend_from_slice(data);
                        Ok(())
                    },
                    |req: &mut Request<'_>, result: Result<(), HttpError>| {
                        let reply = format!("{:?}", result);
                        let _ = req.send_text(&reply);
                    },
                )
            })
            .unwrap();
        let fd = connect(&mut server).await;

        server
            .network_mut()
            .push(fd, b"POST /upload HTTP/1.1\r\nContent-Length: 8\r\n\r\nabc");
        poll(&mut server, 1).await;
        assert_eq!(*body.borrow(), b"abc");
        assert!(server.network_mut().take_output(fd).is_empty());

        let out = exchange(&mut server, fd, b"defgh").await;
        assert_eq!(*body.borrow(), b"abcdefgh");
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nOk(())");
    }

    #[tokio::test]
    async fn test_deferred_body_peer_gone() {
        let done = Rc::new(Cell::new(None));
        let mut server = server();
        let flag = done.clone();
        server
            .post("/upload", move |req: &mut Request<'_>| {
                let flag = flag.clone();
                req.defer(
                    |_req: &mut Request<'_>, _data: &[u8]| Ok(()),
                    move |_req: &mut Request<'_>, result: Result<(), HttpError>| {
                        flag.set(Some(result));
                    },
                )
            })
            .unwrap();
        let fd = connect(&mut server).await;

        server
            .network_mut()
            .push(fd, b"POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\nabc");
        poll(&mut server, 1).await;
        assert_eq!(done.get(), None);

        server.network_mut().eof.push(fd);
        poll(&mut server, 2).await;
        assert_eq!(done.get(), Some(Err(HttpError::ConnClosed)));
        assert!(server.network().is_closed(fd));
    }

    #[tokio::test]
    async fn test_deferred_body_rejected() {
        let done = Rc::new(Cell::new(None));
        let mut server = server();
        let flag = done.clone();
        server
            .post("/upload", move |req: &mut Request<'_>| {
                let flag = flag.clone();
                req.defer(
                    |_req: &mut Request<'_>, data: &[u8]| {
                        if data.contains(&b'!') {
                            Err(HttpError::Status(413))
                        } else {
                            Ok(())
                        }
                    },
                    move |_req: &mut Request<'_>, result: Result<(), HttpError>| {
                        flag.set(Some(result));
                    },
                )
            })
            .unwrap();
        let fd = connect(&mut server).await;

        server
            .network_mut()
            .push(fd, b"POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
        poll(&mut server, 1).await;
        assert_eq!(done.get(), None);

        let out = exchange(&mut server, fd, b"de!").await;
        assert_eq!(done.get(), Some(Err(HttpError::Status(413))));
        assert_eq!(
            out,
            b"HTTP/1.1 413 Payload Too Large\r\nContent-Type: text/plain\r\nContent-Length: 17\r\n\r\nPayload Too Large"
        );
        assert!(server.network().is_closed(fd));
    }

    #[tokio::test]
    async fn test_defer_to_file() {
        let mut server = server();
        server.set_file_source(MemFs::default());
        server
            .put("/store", |req: &mut Request<'_>| {
                req.defer_to_file("/data/upload.bin", |req: &mut Request<'_>, result| {
                    let _ = match result {
                        Ok(()) => req.send_text("stored"),
                        Err(err) => req.send_error(err.status(), None),
                    };
                })
            })
            .unwrap();
        let fd = connect(&mut server).await;

        server
            .network_mut()
            .push(fd, b"PUT /store HTTP/1.1\r\nContent-Length: 6\r\n\r\n123");
        let out = exchange(&mut server, fd, b"456").await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nstored");
    }

    #[tokio::test]
    async fn test_send_file_streams() {
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut server = server();
        server.set_file_source(MemFs::default().with_file("/www/app.js", &content));
        server
            .get("/*", |req: &mut Request<'_>| {
                let path = format!("/www{}", req.path());
                req.send_file(&path)
            })
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /app.js HTTP/1.1\r\n\r\n").await;
        let head = b"HTTP/1.1 200 OK\r\n\
            Content-Type: application/javascript\r\n\
            Content-Length: 10000\r\n\
            Cache-Control: public, max-age=86400\r\n\r\n";
        assert_eq!(&out[..head.len()], head);
        assert_eq!(&out[head.len()..], &content[..]);

        let out = exchange(&mut server, fd, b"GET /missing.js HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            out,
            b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 14\r\n\r\nFile not found"
        );
    }

    #[tokio::test]
    async fn test_chunked_response() {
        let mut server = server();
        server
            .get("/chunks", |req: &mut Request<'_>| {
                req.send_chunk(b"hello ")?;
                req.send_chunk(b"world")?;
                req.send_chunk(b"")
            })
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /chunks HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            as_text(out),
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                 6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_provider_response() {
        let done = Rc::new(Cell::new(None));
        let mut server = server();
        let flag = done.clone();
        server
            .get("/stream", move |req: &mut Request<'_>| {
                let mut parts = vec![&b"abc"[..], &b"defg"[..]].into_iter();
                let flag = flag.clone();
                req.send_provider(
                    None,
                    move |buf: &mut [u8]| {
                        Ok(parts.next().map_or(0, |p| {
                            buf[..p.len()].copy_from_slice(p);
                            p.len()
                        }))
                    },
                    move |result| flag.set(Some(result)),
                )
            })
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /stream HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            as_text(out),
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                 3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n"
        );
        assert_eq!(done.get(), Some(Ok(())));
    }

    #[tokio::test]
    async fn test_out_of_send_buffers() {
        let mut server = server();
        server
            .get("/", |req: &mut Request<'_>| req.send_text("ok"))
            .unwrap();

        let mut fds = Vec::new();
        for _ in 0..9 {
            fds.push(connect(&mut server).await);
        }

        // nothing drains, so each response keeps its ring
        server.network_mut().send_limit = Some(0);
        for fd in fds.iter() {
            server.network_mut().push(*fd, b"GET / HTTP/1.1\r\n\r\n");
        }
        poll(&mut server, 2).await;

        let rings: Vec<Option<u8>> = (0..9)
            .map(|slot| server.dispatcher.io.pool.conn(slot).pool_index)
            .collect();
        assert_eq!(&rings[..8], &(0..8u8).map(Some).collect::<Vec<_>>()[..]);
        assert_eq!(rings[8], None);

        server.network_mut().send_limit = None;
        poll(&mut server, 2).await;
        assert!((0..9).all(|slot| server.dispatcher.io.pool.conn(slot).pool_index.is_none()));
        for fd in fds[..8].iter() {
            assert_eq!(
                server.network_mut().take_output(*fd),
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
            );
        }
        assert_eq!(server.network_mut().take_output(fds[8]), SERVICE_UNAVAILABLE);
        assert!(server.network().is_closed(fds[8]));
    }

    #[tokio::test]
    async fn test_send_budget() {
        let config = Config::default().with_max_spill(1024);
        let mut server = Server::new(MockNet::default(), config);
        server
            .get("/big", |req: &mut Request<'_>| req.send(&[b'x'; 8000]))
            .unwrap()
            .get("/fits", |req: &mut Request<'_>| req.send(&[b'y'; 5000]))
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, b"GET /big HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            out,
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain\r\nContent-Length: 19\r\n\r\nService Unavailable"
        );
        assert!(!server.network().is_closed(fd));

        // one ring plus the spill cap
        let out = exchange(&mut server, fd, b"GET /fits HTTP/1.1\r\n\r\n").await;
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n";
        assert_eq!(&out[..head.len()], head);
        assert_eq!(out.len(), head.len() + 5000);
    }

    #[tokio::test]
    async fn test_websocket_send_budget() {
        let results = Rc::new(RefCell::new(Vec::new()));
        let config = Config::default().with_max_spill(1024);
        let mut server = Server::new(MockNet::default(), config);
        let seen = results.clone();
        server
            .websocket("/ws", move |ws: &mut WebSocket<'_>, event: WsEvent<'_>| {
                if let WsEvent::Message { .. } = event {
                    seen.borrow_mut().push(ws.send(Opcode::Binary, &[7u8; 3000]));
                }
            })
            .unwrap();
        let fd = connect(&mut server).await;
        assert_eq!(exchange(&mut server, fd, WS_UPGRADE).await, WS_ACCEPTED);

        // the client stops reading
        server.network_mut().send_limit = Some(0);
        exchange(&mut server, fd, &masked(0x82, b"a")).await;
        exchange(&mut server, fd, &masked(0x82, b"b")).await;
        assert_eq!(*results.borrow(), [Ok(()), Err(HttpError::NoMem)]);

        // the refused frame left nothing behind
        server.network_mut().send_limit = None;
        poll(&mut server, 2).await;
        let out = server.network_mut().take_output(fd);
        assert_eq!(out.len(), 4 + 3000);
        assert_eq!(&out[..4], &[0x82, 126, 0x0B, 0xB8]);
        assert!(!server.network().is_closed(fd));
    }

    fn echo_server(events: Rc<RefCell<Vec<String>>>) -> Server<MockNet> {
        let mut server = server();
        server
            .websocket("/ws", move |ws: &mut WebSocket<'_>, event: WsEvent<'_>| {
                events.borrow_mut().push(format!("{:?}", event));
                match event {
                    WsEvent::Connect => {
                        let _ = ws.join("room");
                    }
                    WsEvent::Message { data: b"bye", .. } => {
                        let _ = ws.close(1000, "done");
                    }
                    WsEvent::Message {
                        data, frame_type, ..
                    } => {
                        let _ = ws.send(frame_type, data);
                    }
                    _ => {}
                }
            })
            .unwrap();
        server
    }

    #[tokio::test]
    async fn test_websocket_echo() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut server = echo_server(events.clone());
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, WS_UPGRADE).await;
        assert_eq!(out, WS_ACCEPTED);
        assert_eq!(server.ws_connection_count(), 1);

        let out = exchange(&mut server, fd, &masked(0x81, b"hi")).await;
        assert_eq!(out, [0x81, 0x02, b'h', b'i']);

        // ping is answered by the server itself
        let out = exchange(&mut server, fd, &masked(0x89, b"p")).await;
        assert_eq!(out, [0x8A, 0x01, b'p']);

        let out = exchange(&mut server, fd, &masked(0x88, b"")).await;
        assert_eq!(out, [0x88, 0x00]);
        assert!(server.network().is_closed(fd));
        assert_eq!(server.ws_connection_count(), 0);

        assert_eq!(events.borrow().len(), 3);
        assert_eq!(events.borrow()[0], "Connect");
        assert_eq!(events.borrow()[2], "Disconnect");
        assert_eq!(server.stats().total_ws_frames, 1);
    }

    #[tokio::test]
    async fn test_websocket_server_close() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut server = echo_server(events.clone());
        let fd = connect(&mut server).await;
        exchange(&mut server, fd, WS_UPGRADE).await;

        let out = exchange(&mut server, fd, &masked(0x81, b"bye")).await;
        let mut expected = vec![0x88, 0x06, 0x03, 0xE8];
        expected.extend_from_slice(b"done");
        assert_eq!(out, expected);
        assert!(server.network().is_closed(fd));
        assert_eq!(events.borrow().last().map(String::as_str), Some("Disconnect"));
    }

    #[tokio::test]
    async fn test_websocket_protocol_error() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut server = echo_server(events.clone());
        let fd = connect(&mut server).await;
        exchange(&mut server, fd, WS_UPGRADE).await;

        // reserved opcode
        exchange(&mut server, fd, &masked(0x83, b"x")).await;
        assert!(server.network().is_closed(fd));
        let events = events.borrow();
        assert!(events.iter().any(|e| e.starts_with("Error")));
        assert_eq!(events.last().map(String::as_str), Some("Disconnect"));
    }

    #[tokio::test]
    async fn test_upgrade_without_route_is_http() {
        let mut server = server();
        server
            .get("/ws", |req: &mut Request<'_>| req.send_text("plain"))
            .unwrap();
        let fd = connect(&mut server).await;

        let out = exchange(&mut server, fd, WS_UPGRADE).await;
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nplain");
        assert_eq!(server.ws_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_channels_and_broadcast() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut server = echo_server(events);
        let a = connect(&mut server).await;
        let b = connect(&mut server).await;
        exchange(&mut server, a, WS_UPGRADE).await;
        exchange(&mut server, b, WS_UPGRADE).await;
        assert_eq!(server.channel_size("room"), 2);

        assert_eq!(server.publish("room", Opcode::Text, b"news"), 2);
        assert_eq!(server.publish("nobody", Opcode::Text, b"news"), 0);
        assert_eq!(server.broadcast(Opcode::Ping, b""), 0);
        poll(&mut server, 2).await;
        assert_eq!(server.network_mut().take_output(a), b"\x81\x04news");
        assert_eq!(server.network_mut().take_output(b), b"\x81\x04news");

        exchange(&mut server, a, &masked(0x88, b"")).await;
        assert_eq!(server.channel_size("room"), 1);
        assert_eq!(server.broadcast(Opcode::Binary, b"!"), 1);
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let mut server = server();
        let stop = server.stop_handle();
        server
            .get("/stop", move |req: &mut Request<'_>| {
                stop.stop();
                req.send_text("stopping")
            })
            .unwrap();
        let fd = server.network_mut().connect();
        server.network_mut().push(fd, b"GET /stop HTTP/1.1\r\n\r\n");

        server.run().await.unwrap();
        assert!(!server.is_running());
        assert!(server.network().listened);
        assert!(server.network().is_closed(fd));
        assert_eq!(server.connection_count(), 0);
    }
}
