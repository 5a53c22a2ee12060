//! Per-connection records and the fixed size connection pool.
//!
//! The pool owns [`MAX_CONNECTIONS`] [`Connection`] records and three bitmasks over them:
//!
//! * `active`: slots that hold an accepted socket.
//! * `write_pending`: slots with queued outbound data.
//! * `ws_active`: slots that completed a WebSocket upgrade.
//!
//! `write_pending` and `ws_active` are always subsets of `active`, and a slot is in `ws_active`
//! exactly when its state is [`ConnState::WebSocket`]. Every pool mutation keeps these invariants.

use crate::config::MAX_CONNECTIONS;

/// Platform socket handle.
pub type RawFd = i32;

/// Lifecycle of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConnState {
    /// Unused slot.
    Free,
    /// Accepted, nothing received yet.
    New,
    /// Receiving (or between) request heads.
    HttpHeaders,
    /// Receiving a request body.
    HttpBody,
    /// Upgraded to WebSocket.
    WebSocket,
    /// Flushing queued output before closing.
    Closing,
    /// Waiting for the event loop to release the slot.
    Closed,
}

/// HTTP request methods. Anything unrecognised parses as [`Method::Any`], which is also the
/// wildcard used when registering routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    Any,
}

impl Method {
    /// Parse a method token. Matching is exact and case sensitive.
    pub fn from_bytes(value: &[u8]) -> Self {
        match value {
            b"GET" => Method::GET,
            b"POST" => Method::POST,
            b"PUT" => Method::PUT,
            b"DELETE" => Method::DELETE,
            b"HEAD" => Method::HEAD,
            b"OPTIONS" => Method::OPTIONS,
            b"PATCH" => Method::PATCH,
            _ => Method::Any,
        }
    }

    /// The method token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::Any => "*",
        }
    }

    /// Methods whose requests may carry a body the parser waits for.
    pub fn has_body(&self) -> bool {
        matches!(self, Method::POST | Method::PUT | Method::PATCH)
    }
}

impl From<&[u8]> for Method {
    fn from(value: &[u8]) -> Self {
        Method::from_bytes(value)
    }
}

/// Flags describing the request currently on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HttpFlags {
    /// A `Sec-WebSocket-Key` header was seen.
    pub is_websocket: bool,
    /// The connection persists after this request.
    pub keep_alive: bool,
    /// `Upgrade: websocket` was seen.
    pub upgrade_ws: bool,
    /// A handler took over the request body with a deferred reader.
    pub deferred: bool,
    /// The deferred reader is paused. The event loop stops reading from the socket.
    pub defer_paused: bool,
}

impl HttpFlags {
    const fn new() -> Self {
        HttpFlags {
            is_websocket: false,
            keep_alive: true,
            upgrade_ws: false,
            deferred: false,
            defer_paused: false,
        }
    }
}

/// Header fields of the WebSocket frame currently being received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WsFrameFlags {
    /// FIN bit.
    pub fin: bool,
    /// MASK bit.
    pub masked: bool,
    /// Raw opcode.
    pub opcode: u8,
    /// Inside a fragmented message.
    pub fragmented: bool,
}

impl WsFrameFlags {
    const fn new() -> Self {
        WsFrameFlags {
            fin: false,
            masked: false,
            opcode: 0,
            fragmented: false,
        }
    }
}

/// One client connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Socket handle, `None` while the slot is free.
    pub fd: Option<RawFd>,
    /// Lifecycle state.
    pub state: ConnState,
    /// Method of the current request.
    pub method: Method,
    /// Request flags.
    pub http: HttpFlags,
    /// Frame flags.
    pub ws: WsFrameFlags,
    /// Slot in the shared send buffer pool whose ring this connection currently holds. Set
    /// when the ring is attached for output and cleared when it goes back to the pool after
    /// the output drains or the connection closes.
    pub pool_index: Option<u8>,
    /// Bytes of the current request head consumed so far.
    pub header_bytes: u16,
    /// Declared request body length.
    pub content_length: u32,
    /// Request body bytes received so far.
    pub bytes_received: u32,
    /// Payload length of the current frame.
    pub ws_payload_len: u16,
    /// Payload bytes of the current frame received so far.
    pub ws_payload_read: u16,
    /// Masking key of the current frame, in arrival order.
    pub ws_mask_key: [u8; 4],
    /// Identifier of the matched route.
    pub route_id: u16,
    /// Length of the request target.
    pub url_len: u8,
    /// Tick of the last successful read or write.
    pub last_activity: u32,
}

impl Connection {
    /// An unused record.
    pub const fn new() -> Self {
        Connection {
            fd: None,
            state: ConnState::Free,
            method: Method::Any,
            http: HttpFlags::new(),
            ws: WsFrameFlags::new(),
            pool_index: None,
            header_bytes: 0,
            content_length: 0,
            bytes_received: 0,
            ws_payload_len: 0,
            ws_payload_read: 0,
            ws_mask_key: [0; 4],
            route_id: 0,
            url_len: 0,
            last_activity: 0,
        }
    }

    /// Prepare for the next request on a kept-alive connection.
    pub fn reset_request(&mut self) {
        self.method = Method::Any;
        self.http = HttpFlags::new();
        self.header_bytes = 0;
        self.content_length = 0;
        self.bytes_received = 0;
        self.route_id = 0;
        self.url_len = 0;
    }

    /// Whether the whole declared body has arrived.
    pub fn body_complete(&self) -> bool {
        self.bytes_received >= self.content_length
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the set bits of a slot mask, lowest first.
#[derive(Debug, Clone, Copy)]
pub struct SlotIter(u32);

impl SlotIter {
    /// Iterate the slots set in `mask`.
    pub fn new(mask: u32) -> Self {
        SlotIter(mask)
    }
}

impl Iterator for SlotIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }

        let slot = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

const ALL_SLOTS: u32 = if MAX_CONNECTIONS == 32 {
    u32::MAX
} else {
    (1u32 << MAX_CONNECTIONS) - 1
};

#[inline]
fn bit(slot: usize) -> u32 {
    1u32 << slot
}

/// Fixed size pool of [`Connection`] records.
#[derive(Debug)]
pub struct ConnectionPool {
    connections: [Connection; MAX_CONNECTIONS],
    active: u32,
    write_pending: u32,
    ws_active: u32,
}

impl ConnectionPool {
    /// An empty pool.
    pub const fn new() -> Self {
        ConnectionPool {
            connections: [const { Connection::new() }; MAX_CONNECTIONS],
            active: 0,
            write_pending: 0,
            ws_active: 0,
        }
    }

    /// Return every slot to [`ConnState::Free`] and clear all masks.
    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// Claim the lowest free slot for `fd`. Returns `None`, leaving the pool untouched, when
    /// every slot is in use.
    pub fn accept_into_slot(&mut self, fd: RawFd, tick: u32) -> Option<usize> {
        let free = !self.active & ALL_SLOTS;
        if free == 0 {
            return None;
        }

        let slot = free.trailing_zeros() as usize;
        let conn = &mut self.connections[slot];
        *conn = Connection::new();
        conn.fd = Some(fd);
        conn.state = ConnState::New;
        conn.last_activity = tick;
        self.active |= bit(slot);

        Some(slot)
    }

    /// Slot holding `fd`, if any.
    pub fn find_by_fd(&self, fd: RawFd) -> Option<usize> {
        SlotIter::new(self.active).find(|slot| self.connections[*slot].fd == Some(fd))
    }

    /// The record in `slot`.
    pub fn get(&self, slot: usize) -> Option<&Connection> {
        self.connections.get(slot)
    }

    /// The record in `slot`, mutably. Callers that change the state to or from
    /// [`ConnState::WebSocket`] also keep `ws_active` in step.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.connections.get_mut(slot)
    }

    pub(crate) fn conn(&self, slot: usize) -> &Connection {
        &self.connections[slot]
    }

    pub(crate) fn conn_mut(&mut self, slot: usize) -> &mut Connection {
        &mut self.connections[slot]
    }

    /// Whether `slot` holds an accepted socket.
    pub fn is_active(&self, slot: usize) -> bool {
        self.active & bit(slot) != 0
    }

    /// Mark `slot` as holding a socket.
    pub fn mark_active(&mut self, slot: usize) {
        self.active |= bit(slot);
    }

    /// Drop `slot` from every mask.
    pub fn mark_inactive(&mut self, slot: usize) {
        let mask = !bit(slot);
        self.active &= mask;
        self.write_pending &= mask;
        self.ws_active &= mask;
    }

    /// Flag queued output on an active slot.
    pub fn mark_write_pending(&mut self, slot: usize) {
        if self.is_active(slot) {
            self.write_pending |= bit(slot);
        }
    }

    /// Clear the queued output flag.
    pub fn clear_write_pending(&mut self, slot: usize) {
        self.write_pending &= !bit(slot);
    }

    /// Whether `slot` has queued output.
    pub fn is_write_pending(&self, slot: usize) -> bool {
        self.write_pending & bit(slot) != 0
    }

    /// Record a completed upgrade. The slot must be active and in [`ConnState::WebSocket`].
    pub fn mark_ws_active(&mut self, slot: usize) {
        if self.is_active(slot) && self.connections[slot].state == ConnState::WebSocket {
            self.ws_active |= bit(slot);
        }
    }

    /// Clear the upgraded flag.
    pub fn clear_ws_active(&mut self, slot: usize) {
        self.ws_active &= !bit(slot);
    }

    /// Whether `slot` is an upgraded WebSocket.
    pub fn is_ws_active(&self, slot: usize) -> bool {
        self.ws_active & bit(slot) != 0
    }

    /// Move `slot` to `state`, keeping `ws_active` consistent.
    pub fn set_state(&mut self, slot: usize, state: ConnState) {
        self.connections[slot].state = state;
        if state == ConnState::WebSocket {
            self.mark_ws_active(slot);
        } else {
            self.clear_ws_active(slot);
        }
    }

    /// Mask of active slots.
    pub fn active_mask(&self) -> u32 {
        self.active
    }

    /// Mask of slots with queued output.
    pub fn write_pending_mask(&self) -> u32 {
        self.write_pending
    }

    /// Mask of upgraded slots.
    pub fn ws_active_mask(&self) -> u32 {
        self.ws_active
    }

    /// Mask of active slots waiting to be released.
    pub fn closed_mask(&self) -> u32 {
        SlotIter::new(self.active)
            .filter(|slot| self.connections[*slot].state == ConnState::Closed)
            .fold(0, |mask, slot| mask | bit(slot))
    }

    /// Number of active slots.
    pub fn count_active(&self) -> u32 {
        self.active.count_ones()
    }

    /// Number of upgraded slots.
    pub fn count_ws_active(&self) -> u32 {
        self.ws_active.count_ones()
    }

    /// Active slots, lowest first.
    pub fn iter_active(&self) -> SlotIter {
        SlotIter::new(self.active)
    }

    /// Return `slot` to [`ConnState::Free`], handing back its socket for the caller to close.
    pub fn release(&mut self, slot: usize) -> Option<RawFd> {
        self.mark_inactive(slot);
        let fd = self.connections[slot].fd.take();
        self.connections[slot] = Connection::new();
        fd
    }

    /// Release every slot in [`ConnState::Closed`], passing each slot and socket to `on_close`.
    pub fn cleanup_closed(&mut self, mut on_close: impl FnMut(usize, RawFd)) {
        for slot in SlotIter::new(self.closed_mask()) {
            if let Some(fd) = self.release(slot) {
                on_close(slot, fd);
            }
        }
    }

    /// Check the mask invariants.
    pub fn is_consistent(&self) -> bool {
        let subsets = self.write_pending & !self.active == 0 && self.ws_active & !self.active == 0;
        let ws_states = (0..MAX_CONNECTIONS).all(|slot| {
            let upgraded = self.connections[slot].state == ConnState::WebSocket;
            !self.is_active(slot) || upgraded == self.is_ws_active(slot)
        });
        let free_states = (0..MAX_CONNECTIONS).all(|slot| {
            self.is_active(slot) || self.connections[slot].state == ConnState::Free
        });

        subsets && ws_states && free_states
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
