//! The readiness loop.
//!
//! One iteration waits for readiness on the listener and on every connection, then:
//!
//! 1. accepts at most one connection (a full pool closes the new socket straight away),
//! 2. drains connections that have output queued and are writable,
//! 3. reads from readable connections and dispatches the bytes by connection state,
//! 4. on a wait timeout, advances the tick and retires idle connections (WebSockets excepted),
//! 5. releases every connection left in [`ConnState::Closed`].
//!
//! What happens to the bytes is up to an [`EventHandler`]; the loop itself only moves data
//! between the [`Network`] and the handler. Errors are confined to the connection they occur
//! on and never end the loop.

use alloc::vec;
use alloc::vec::Vec;

use embedded_io_async::{Error as _, ErrorType};

use crate::config::{Config, MAX_CONNECTIONS};
use crate::connection::{ConnState, ConnectionPool, RawFd, SlotIter};
use crate::error::Error;

/// What the loop wants to hear about in the next wait.
#[derive(Debug, Clone, Copy)]
pub struct Interest<'s> {
    /// Slots to watch for readability. The listener is always watched.
    pub read: u32,
    /// Slots to watch for writability.
    pub write: u32,
    /// Socket of each slot, `None` for free slots.
    pub sockets: &'s [Option<RawFd>],
    /// Highest socket among `sockets`.
    pub max_fd: Option<RawFd>,
}

/// Result of a wait. All empty means the wait timed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A connection is waiting on the listener.
    pub listener: bool,
    /// Readable slots.
    pub readable: u32,
    /// Writable slots.
    pub writable: u32,
}

impl Readiness {
    /// Whether nothing became ready.
    pub fn is_timeout(&self) -> bool {
        !self.listener && self.readable == 0 && self.writable == 0
    }
}

/// Socket layer of a platform.
pub trait Network: ErrorType {
    /// Bind and listen as described by `config`.
    fn listen(&mut self, config: &Config) -> Result<(), Self::Error>;

    /// Accept a pending connection, made non blocking and with `TCP_NODELAY` when `nodelay`
    /// is set. `None` when nothing was pending.
    fn accept(&mut self, nodelay: bool) -> Result<Option<RawFd>, Self::Error>;

    /// Wait up to `timeout_ms` for any of `interest` to become ready.
    async fn wait(
        &mut self,
        interest: &Interest<'_>,
        timeout_ms: u32,
    ) -> Result<Readiness, Self::Error>;

    /// Read from `socket`. 0 means the peer closed the connection.
    async fn recv(&mut self, socket: RawFd, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write to `socket`. 0 means the socket cannot take more right now.
    async fn send(&mut self, socket: RawFd, data: &[u8]) -> Result<usize, Self::Error>;

    /// Close `socket`.
    fn close(&mut self, socket: RawFd);
}

/// Connection level callbacks driven by the [`EventLoop`].
pub trait EventHandler {
    /// The connection pool the loop schedules from.
    fn pool(&self) -> &ConnectionPool;

    /// Mutable access to the pool.
    fn pool_mut(&mut self) -> &mut ConnectionPool;

    /// A connection was accepted into `slot`.
    fn on_connect(&mut self, slot: usize);

    /// Bytes for a connection in [`ConnState::New`] or [`ConnState::HttpHeaders`].
    fn on_http_request(&mut self, slot: usize, data: &mut [u8]) -> Result<(), Error>;

    /// Bytes for a connection in [`ConnState::HttpBody`].
    fn on_http_body(&mut self, slot: usize, data: &mut [u8]) -> Result<(), Error>;

    /// Bytes for a connection in [`ConnState::WebSocket`].
    fn on_ws_frame(&mut self, slot: usize, data: &mut [u8]) -> Result<(), Error>;

    /// An upgraded connection is going away.
    fn on_ws_disconnect(&mut self, slot: usize);

    /// `slot` is about to be released.
    fn on_disconnect(&mut self, slot: usize);

    /// The next bytes to write for `slot`, refilling from files or providers as needed. Empty
    /// when everything has been written.
    fn poll_output(&mut self, slot: usize) -> &[u8];

    /// `n` bytes returned by [`EventHandler::poll_output`] were written.
    fn consume_output(&mut self, slot: usize, n: usize);

    /// All output of `slot` has been written.
    fn output_drained(&mut self, slot: usize);
}

/// Drives a [`Network`] and an [`EventHandler`].
pub struct EventLoop<N: Network> {
    net: N,
    config: Config,
    tick: u32,
    timeout_ticks: u32,
    io_buf: Vec<u8>,
    listening: bool,
}

impl<N: Network> EventLoop<N> {
    /// A loop over `net`. Nothing happens until the first [`EventLoop::run_once`].
    pub fn new(net: N, config: Config) -> Self {
        EventLoop {
            net,
            timeout_ticks: config.timeout_ticks(),
            io_buf: vec![0; config.io_buffer_size],
            config,
            tick: 0,
            listening: false,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of wait timeouts so far.
    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// The platform network.
    pub fn network(&self) -> &N {
        &self.net
    }

    /// The platform network, mutably.
    pub fn network_mut(&mut self) -> &mut N {
        &mut self.net
    }

    /// Start listening. Called by the first iteration if not called before.
    pub fn listen(&mut self) -> Result<(), Error> {
        self.net
            .listen(&self.config)
            .map_err(|e| Error::from_kind(e.kind()))?;
        self.listening = true;
        info!("listening on port {}", self.config.port);
        Ok(())
    }

    /// Run one iteration.
    pub async fn run_once<H: EventHandler>(&mut self, handler: &mut H) -> Result<(), Error> {
        if !self.listening {
            self.listen()?;
        }

        let mut sockets = [None; MAX_CONNECTIONS];
        let ready = {
            let pool = handler.pool();
            let mut read = 0;
            let mut max_fd = None;
            for slot in pool.iter_active() {
                let conn = pool.conn(slot);
                sockets[slot] = conn.fd;
                max_fd = max_fd.max(conn.fd);
                let reading = !matches!(conn.state, ConnState::Closing | ConnState::Closed);
                if reading && !conn.http.defer_paused {
                    read |= 1 << slot;
                }
            }

            let interest = Interest {
                read,
                write: pool.write_pending_mask(),
                sockets: &sockets,
                max_fd,
            };
            self.net
                .wait(&interest, self.config.select_timeout_ms)
                .await
                .map_err(|e| Error::from_kind(e.kind()))?
        };

        if ready.listener {
            self.accept(handler);
        }

        let writable = ready.writable & handler.pool().write_pending_mask();
        for slot in SlotIter::new(writable) {
            self.drain(handler, slot).await;
        }

        let readable = ready.readable & handler.pool().active_mask();
        for slot in SlotIter::new(readable) {
            self.read(handler, slot).await;
        }

        if ready.is_timeout() {
            self.tick = self.tick.wrapping_add(1);
            self.check_timeouts(handler);
        }

        self.cleanup(handler);
        Ok(())
    }

    /// Flush what can be written without blocking, then close every connection.
    pub async fn close_all<H: EventHandler>(&mut self, handler: &mut H) {
        for slot in SlotIter::new(handler.pool().write_pending_mask()) {
            self.drain(handler, slot).await;
        }
        for slot in handler.pool().iter_active() {
            self.close(handler, slot);
        }
        self.cleanup(handler);
        debug!("all connections closed");
    }

    fn accept<H: EventHandler>(&mut self, handler: &mut H) {
        let fd = match self.net.accept(self.config.nodelay) {
            Ok(Some(fd)) => fd,
            Ok(None) => return,
            Err(e) => {
                let err = Error::from_kind(e.kind());
                warn!("accept failed: {:?}", err);
                return;
            }
        };

        match handler.pool_mut().accept_into_slot(fd, self.tick) {
            Some(slot) => {
                debug!("accepted connection into slot {}", slot);
                handler.on_connect(slot);
            }
            None => {
                warn!("connection pool full, rejecting connection");
                self.net.close(fd);
            }
        }
    }

    async fn drain<H: EventHandler>(&mut self, handler: &mut H, slot: usize) {
        let Some(fd) = handler.pool().conn(slot).fd else {
            return;
        };

        loop {
            let out = handler.poll_output(slot);
            if out.is_empty() {
                handler.output_drained(slot);
                return;
            }

            match self.net.send(fd, out).await {
                Ok(0) => return,
                Ok(n) => {
                    handler.consume_output(slot, n);
                    handler.pool_mut().conn_mut(slot).last_activity = self.tick;
                }
                Err(e) => {
                    let err = Error::from_kind(e.kind());
                    debug!("send on slot {} failed: {:?}", slot, err);
                    self.close(handler, slot);
                    return;
                }
            }
        }
    }

    async fn read<H: EventHandler>(&mut self, handler: &mut H, slot: usize) {
        let (fd, state) = {
            let conn = handler.pool().conn(slot);
            (conn.fd, conn.state)
        };
        let Some(fd) = fd else {
            return;
        };
        if matches!(state, ConnState::Closing | ConnState::Closed) {
            return;
        }

        let n = match self.net.recv(fd, &mut self.io_buf).await {
            Ok(0) => {
                debug!("slot {} closed by peer", slot);
                self.close(handler, slot);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let err = Error::from_kind(e.kind());
                debug!("recv on slot {} failed: {:?}", slot, err);
                self.close(handler, slot);
                return;
            }
        };

        handler.pool_mut().conn_mut(slot).last_activity = self.tick;
        let data = &mut self.io_buf[..n];
        let res = match state {
            ConnState::New | ConnState::HttpHeaders => handler.on_http_request(slot, data),
            ConnState::HttpBody => handler.on_http_body(slot, data),
            ConnState::WebSocket => handler.on_ws_frame(slot, data),
            ConnState::Free | ConnState::Closing | ConnState::Closed => Ok(()),
        };

        if let Err(err) = res {
            debug!("closing slot {}: {:?}", slot, err);
            self.close(handler, slot);
        }
    }

    fn close<H: EventHandler>(&mut self, handler: &mut H, slot: usize) {
        if handler.pool().is_ws_active(slot) {
            handler.on_ws_disconnect(slot);
        }
        handler.pool_mut().set_state(slot, ConnState::Closed);
    }

    fn check_timeouts<H: EventHandler>(&mut self, handler: &mut H) {
        let pool = handler.pool();
        let candidates = pool.active_mask() & !pool.ws_active_mask();
        let mut expired = 0u32;
        for slot in SlotIter::new(candidates) {
            let conn = pool.conn(slot);
            if self.tick.wrapping_sub(conn.last_activity) > self.timeout_ticks {
                expired |= 1 << slot;
            }
        }

        for slot in SlotIter::new(expired) {
            debug!("slot {} timed out", slot);
            self.close(handler, slot);
        }
    }

    fn cleanup<H: EventHandler>(&mut self, handler: &mut H) {
        for slot in SlotIter::new(handler.pool().closed_mask()) {
            handler.on_disconnect(slot);
            if let Some(fd) = handler.pool_mut().release(slot) {
                self.net.close(fd);
            }
        }
    }
}
