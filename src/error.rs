use embedded_io_async::ErrorKind;

use crate::send_buffer::QueueFull;
use crate::fs::FsError;
use crate::websocket::WebsocketError;

/// Error is the reason a connection (or the server) stopped doing useful work. It is what the
/// event loop logs when it retires a connection, and what [`Server::run`](crate::server::Server::run)
/// returns when the listener cannot be set up.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Malformed HTTP or WebSocket data from the peer.
    Protocol(&'static str),
    /// No free connection slot, send ring or channel.
    CapacityExhausted,
    /// A handler returned an error after it had already started a response.
    HandlerFailure,
    /// The connection sat idle for longer than the configured timeout.
    Timeout,
    /// The peer closed or reset the connection.
    PeerClosed,
    /// Any other transport failure.
    Io,
}

impl Error {
    /// Classify a transport error.
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => Error::PeerClosed,
            ErrorKind::TimedOut => Error::Timeout,
            ErrorKind::OutOfMemory => Error::CapacityExhausted,
            ErrorKind::InvalidData => Error::Protocol("invalid data"),
            _ => Error::Io,
        }
    }
}

/// HttpError is returned by handlers, middleware and the request and response APIs. Errors that
/// reach the dispatcher before a response was started are turned into an HTTP error response.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum HttpError {
    /// No route or resource matched.
    NotFound,
    /// The request, or an argument passed to the API, was invalid.
    InvalidArg,
    /// A bounded resource (send ring, channel table, spill memory) is exhausted.
    NoMem,
    /// A transport or filesystem operation failed.
    Io,
    /// The connection closed before the operation finished.
    ConnClosed,
    /// Middleware rejected the request.
    Middleware,
    /// Respond with this status code.
    Status(u16),
}

impl HttpError {
    /// The status code used when this error is turned into a response.
    pub fn status(&self) -> u16 {
        match self {
            HttpError::NotFound => 404,
            HttpError::InvalidArg => 400,
            HttpError::NoMem => 503,
            HttpError::Status(code) => *code,
            HttpError::Middleware | HttpError::Io | HttpError::ConnClosed => 500,
        }
    }

    /// The plain text body used when this error is turned into a response.
    pub fn message(&self) -> &'static str {
        match self {
            HttpError::NotFound => "Not Found",
            HttpError::InvalidArg => "Bad Request",
            HttpError::NoMem => "Service Unavailable",
            HttpError::Middleware => "Middleware Error",
            HttpError::Status(code) => crate::response::StatusCode(*code).reason(),
            HttpError::Io | HttpError::ConnClosed => "Internal Server Error",
        }
    }
}

impl From<QueueFull> for HttpError {
    fn from(_: QueueFull) -> Self {
        HttpError::NoMem
    }
}

impl From<FsError> for HttpError {
    fn from(value: FsError) -> Self {
        match value {
            FsError::NotFound => HttpError::NotFound,
            FsError::Unsupported => HttpError::InvalidArg,
            FsError::Io => HttpError::Io,
        }
    }
}

impl From<WebsocketError> for HttpError {
    fn from(value: WebsocketError) -> Self {
        match value {
            WebsocketError::OutOfMemory => HttpError::NoMem,
            _ => HttpError::InvalidArg,
        }
    }
}
