//! # evhttpd
//!
//! `evhttpd` is a single threaded, event loop driven HTTP/1.1 and WebSocket server core aimed at
//! `no_std` targets with a heap but little memory to spare, such as microcontrollers running a
//! TCP/IP stack.
//!
//! This crate provides:
//!
//! * a fixed size connection pool driven by a readiness loop over any [`event_loop::Network`].
//! * an incremental request head parser and a WebSocket framer that never need the whole
//!   message in memory.
//! * radix tree routing with parameters, wildcards, mounted routers and middleware.
//! * responses queued through shared send rings, including streamed files, chunked bodies and
//!   pull based providers.
//! * WebSocket sessions with broadcast and named channels.
//!
//! This crate does **not** provide:
//!
//! * TLS, HTTP/2, or request pipelining.
//! * a socket implementation. The platform supplies one by implementing
//!   [`event_loop::Network`].
//!
//! ## Basic Use
//!
//! Create a [`server::Server`] with the platform's [`event_loop::Network`] and a
//! [`config::Config`], register routes, then `run()` it. Handlers get a [`request::Request`] to
//! read the request from and write the response to. Nothing blocks: responses are queued and
//! written out by the loop as the socket drains.
//!
//! ```
//! use evhttpd::config::Config;
//! use evhttpd::connection::RawFd;
//! use evhttpd::error::HttpError;
//! use evhttpd::event_loop::{Interest, Network, Readiness};
//! use evhttpd::request::Request;
//! use evhttpd::server::Server;
//!
//! // A network with nobody on it. A real one wraps the platform's sockets and `select`.
//! struct Quiet;
//!
//! impl embedded_io_async::ErrorType for Quiet {
//!     type Error = embedded_io_async::ErrorKind;
//! }
//!
//! impl Network for Quiet {
//!     fn listen(&mut self, _config: &Config) -> Result<(), Self::Error> {
//!         Ok(())
//!     }
//!     fn accept(&mut self, _nodelay: bool) -> Result<Option<RawFd>, Self::Error> {
//!         Ok(None)
//!     }
//!     async fn wait(&mut self, _: &Interest<'_>, _timeout_ms: u32) -> Result<Readiness, Self::Error> {
//!         Ok(Readiness::default())
//!     }
//!     async fn recv(&mut self, _fd: RawFd, _buf: &mut [u8]) -> Result<usize, Self::Error> {
//!         Ok(0)
//!     }
//!     async fn send(&mut self, _fd: RawFd, data: &[u8]) -> Result<usize, Self::Error> {
//!         Ok(data.len())
//!     }
//!     fn close(&mut self, _fd: RawFd) {}
//! }
//!
//! async fn serve() -> Result<(), HttpError> {
//!     let mut server = Server::new(Quiet, Config::default());
//!     server
//!         .get("/", |req: &mut Request<'_>| req.send_text("<html>...</html>"))?
//!         .get("/api/status", |req: &mut Request<'_>| req.send_json(r#"{"ok":true}"#))?;
//!
//!     // one iteration; `run()` loops until a `StopHandle` stops it
//!     let _ = server.poll_once().await;
//!     Ok(())
//! }
//! #
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! #     serve().await.unwrap();
//! # })
//! ```
//!
//! ## Logging
//!
//! Enable the `log` feature to log through the `log` crate, or `defmt` for `defmt`. Without
//! either, logging compiles away.

#![no_std]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

extern crate alloc;

#[macro_use]
mod fmt;

mod ascii;
pub mod channels;
pub mod config;
pub mod connection;
/// Error types
pub mod error;
pub mod event_loop;
pub mod fs;
/// HTTP Headers
pub mod header;
pub mod parser;
pub mod request;
pub mod response;
pub mod router;
pub mod send_buffer;
pub mod server;
pub mod websocket;

pub use config::Config;
pub use error::{Error, HttpError};
pub use request::Request;
pub use router::{Next, Router};
pub use server::{Server, StopHandle, WebSocket, WsEvent};
pub use websocket::Opcode;
