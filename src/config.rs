//! Compile time capacities and the runtime [`Config`].
//!
//! Every buffer in the server is sized from the constants below. The pool related limits are
//! asserted at compile time because the pool bookkeeping lives in fixed width bitmasks.

/// Maximum simultaneously open client connections. Bounded by the width of the pool bitmasks.
pub const MAX_CONNECTIONS: usize = 16;
/// Largest accepted WebSocket data frame payload.
pub const WS_MAX_PAYLOAD: usize = 8192;
/// Initial capacity of a connection's WebSocket payload buffer.
pub const WS_DEFAULT_BUFFER: usize = 256;
/// Capacity of each send ring. One byte is kept free to tell a full ring from an empty one.
pub const SEND_BUFFER_SIZE: usize = 4096;
/// Number of send rings shared between all connections.
pub const SEND_BUFFER_POOL_SIZE: usize = 8;
/// Default cap on the bytes a connection may park beyond its send ring.
pub const SEND_SPILL_LIMIT: usize = 16 * 1024;
/// Cap on the bytes of a request head (request line plus headers).
pub const MAX_REQUEST_HEADER_BYTES: usize = 4096;
/// Longest method token the parser accepts.
pub const MAX_METHOD_LEN: usize = 7;
/// Longest request target the parser accepts.
pub const MAX_URL_LEN: usize = 255;
/// Longest header name the parser accepts.
pub const MAX_HEADER_KEY_LEN: usize = 64;
/// Longest header value the parser accepts.
pub const MAX_HEADER_VALUE_LEN: usize = 255;
/// Longest `Sec-WebSocket-Key` kept for the handshake.
pub const MAX_WS_KEY_LEN: usize = 31;
/// Number of request headers kept for lookup by handlers.
pub const MAX_STORED_HEADERS: usize = 16;
/// Bytes available for the names and values of stored headers.
pub const HEADER_STORE_SIZE: usize = 1024;
/// Query parameters considered by [`Request::query`](crate::request::Request::query).
pub const MAX_QUERY_PARAMS: usize = 8;
/// Route parameters captured per match.
pub const MAX_ROUTE_PARAMS: usize = 8;
/// Middleware collected for one request across all levels.
pub const MAX_TOTAL_MIDDLEWARE: usize = 16;
/// Middleware attached to a single route.
pub const MAX_ROUTE_MIDDLEWARE: usize = 4;
/// Named WebSocket broadcast channels.
pub const MAX_CHANNELS: usize = 32;
/// Longest channel name.
pub const MAX_CHANNEL_NAME_LEN: usize = 31;
/// Default size of the shared receive buffer.
pub const BODY_PREFETCH_SIZE: usize = 1024;

const _: () = assert!(MAX_CONNECTIONS <= 32);
const _: () = assert!(SEND_BUFFER_POOL_SIZE <= 8);
const _: () = assert!(MAX_CHANNELS <= 32);
const _: () = assert!(SEND_BUFFER_SIZE > 16);

/// Runtime configuration of a [`Server`](crate::server::Server).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// TCP port to listen on.
    pub port: u16,
    /// Listen backlog.
    pub backlog: u8,
    /// Idle HTTP connection timeout in milliseconds. WebSocket connections are exempt.
    pub timeout_ms: u32,
    /// Upper bound on a single readiness wait in milliseconds. Also the length of one tick.
    pub select_timeout_ms: u32,
    /// Size of the buffer each `recv` reads into.
    pub io_buffer_size: usize,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
    /// Set `SO_REUSEADDR` on the listener.
    pub reuseaddr: bool,
    /// Bytes each connection may queue beyond what its send ring holds. Writes that would
    /// exceed it fail with [`HttpError::NoMem`](crate::error::HttpError::NoMem).
    pub max_spill: usize,
}

impl Config {
    /// The default configuration: port 80, backlog 5, 30s idle timeout, 1s ticks.
    pub const fn new() -> Self {
        Config {
            port: 80,
            backlog: 5,
            timeout_ms: 30_000,
            select_timeout_ms: 1_000,
            io_buffer_size: BODY_PREFETCH_SIZE,
            nodelay: true,
            reuseaddr: true,
            max_spill: SEND_SPILL_LIMIT,
        }
    }

    /// Set the listening port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the listen backlog.
    pub fn with_backlog(mut self, backlog: u8) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the idle timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the readiness wait bound.
    pub fn with_select_timeout_ms(mut self, select_timeout_ms: u32) -> Self {
        self.select_timeout_ms = select_timeout_ms;
        self
    }

    /// Set the receive buffer size. Values below 64 bytes are raised to 64.
    pub fn with_io_buffer_size(mut self, size: usize) -> Self {
        self.io_buffer_size = size.max(64);
        self
    }

    /// Enable or disable `TCP_NODELAY` on accepted sockets.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Enable or disable `SO_REUSEADDR` on the listener.
    pub fn with_reuseaddr(mut self, reuseaddr: bool) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    /// Set the per connection spill cap. Zero limits output to the send ring.
    pub fn with_max_spill(mut self, max_spill: usize) -> Self {
        self.max_spill = max_spill;
        self
    }

    /// Idle timeout expressed in event loop ticks. Never less than one tick.
    pub fn timeout_ticks(&self) -> u32 {
        let tick = self.select_timeout_ms.max(1);
        (self.timeout_ms / tick).max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 80);
        assert_eq!(cfg.backlog, 5);
        assert_eq!(cfg.timeout_ms, 30_000);
        assert_eq!(cfg.select_timeout_ms, 1_000);
        assert_eq!(cfg.io_buffer_size, 1024);
        assert!(cfg.nodelay);
        assert!(cfg.reuseaddr);
        assert_eq!(cfg.max_spill, 16 * 1024);
        assert_eq!(cfg.timeout_ticks(), 30);
    }

    #[test]
    fn test_timeout_ticks() {
        let cfg = Config::new()
            .with_timeout_ms(500)
            .with_select_timeout_ms(1_000);
        assert_eq!(cfg.timeout_ticks(), 1);

        let cfg = Config::new().with_timeout_ms(5_000).with_select_timeout_ms(0);
        assert_eq!(cfg.timeout_ticks(), 5_000);
    }
}
