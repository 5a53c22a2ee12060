//! Incremental HTTP/1.1 request head parser.
//!
//! A [`ParserContext`] lives with each connection and survives between reads, so a request head
//! may arrive in any number of fragments. The parser keeps its own copies of the method, target
//! and current header name and value, which means nothing it returns points into the receive
//! buffer. Feeding a head in one call or byte by byte produces the same result.
//!
//! Headers the server acts on (`Content-Length`, `Connection`, `Upgrade`, `Sec-WebSocket-Key`)
//! update the [`Connection`] as soon as each header line ends. All headers are also stored in
//! a [`Headers`] set for lookup by handlers.

use arrayvec::ArrayVec;

use crate::ascii::{is_token_char, is_whitespace, COLON, CR, LF, SP};
use crate::config::{
    MAX_HEADER_KEY_LEN, MAX_HEADER_VALUE_LEN, MAX_METHOD_LEN, MAX_REQUEST_HEADER_BYTES,
    MAX_URL_LEN, MAX_WS_KEY_LEN,
};
use crate::connection::{ConnState, Connection, Method};
use crate::header::{
    is_websocket_upgrade, parse_content_length, parse_keep_alive, Headers, RequestHeader,
};

/// Where the parser is within a request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum ParseState {
    Method,
    Url,
    Version,
    HeaderKey,
    HeaderValue,
    HeadersComplete,
    Body,
    Complete,
    Error,
}

/// Outcome of feeding bytes to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseStatus {
    /// The head is complete and a request body follows.
    Ok,
    /// The head is incomplete.
    NeedMore,
    /// The request is complete (or upgraded to a WebSocket).
    Complete,
}

/// Malformed request heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ParseError {
    /// The request line starts with a space.
    EmptyMethod,
    /// The method is longer than seven characters.
    MethodTooLong,
    /// The method contains a non token character.
    InvalidMethod,
    /// The request target is empty.
    EmptyUrl,
    /// The request target exceeds its limit.
    UrlTooLong,
    /// The request line ended before the target did.
    IncompleteRequestLine,
    /// A header line has no name.
    EmptyHeaderKey,
    /// A header name exceeds its limit, or a header line has no colon.
    HeaderKeyTooLong,
    /// A header value exceeds its limit.
    HeaderValueTooLong,
    /// The request head exceeds its limit.
    HeadersTooLarge,
}

impl ParseError {
    /// Short description for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseError::EmptyMethod => "empty method",
            ParseError::MethodTooLong => "method too long",
            ParseError::InvalidMethod => "invalid method",
            ParseError::EmptyUrl => "empty url",
            ParseError::UrlTooLong => "url too long",
            ParseError::IncompleteRequestLine => "incomplete request line",
            ParseError::EmptyHeaderKey => "empty header name",
            ParseError::HeaderKeyTooLong => "invalid header name",
            ParseError::HeaderValueTooLong => "header value too long",
            ParseError::HeadersTooLarge => "request head too large",
        }
    }
}

/// Persistent parser state for one connection.
#[derive(Debug)]
pub struct ParserContext {
    state: ParseState,
    method: ArrayVec<u8, MAX_METHOD_LEN>,
    url: ArrayVec<u8, MAX_URL_LEN>,
    key: ArrayVec<u8, MAX_HEADER_KEY_LEN>,
    value: ArrayVec<u8, MAX_HEADER_VALUE_LEN>,
    value_started: bool,
    value_done: bool,
    head_bytes: usize,
    body_offset: usize,
}

impl ParserContext {
    /// A parser waiting for a request line.
    pub fn new() -> Self {
        ParserContext {
            state: ParseState::Method,
            method: ArrayVec::new(),
            url: ArrayVec::new(),
            key: ArrayVec::new(),
            value: ArrayVec::new(),
            value_started: false,
            value_done: false,
            head_bytes: 0,
            body_offset: 0,
        }
    }

    /// Prepare for the next request head.
    pub fn reset(&mut self) {
        self.state = ParseState::Method;
        self.method.clear();
        self.url.clear();
        self.key.clear();
        self.value.clear();
        self.value_started = false;
        self.value_done = false;
        self.head_bytes = 0;
        self.body_offset = 0;
    }

    /// Current state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// The request target as received.
    pub fn url(&self) -> &[u8] {
        &self.url
    }

    /// The method token as received.
    pub fn method(&self) -> &[u8] {
        &self.method
    }

    /// Offset, within the most recent input, of the first byte after the request head.
    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    /// Feed `input` to the parser.
    ///
    /// Returns [`ParseStatus::Ok`] once the head is complete and a body of
    /// `conn.content_length` bytes follows, in which case `conn.state` is
    /// [`ConnState::HttpBody`]. Returns [`ParseStatus::Complete`] for requests without a body,
    /// with `conn.state` set to [`ConnState::HttpHeaders`], or [`ConnState::WebSocket`] when the
    /// request asks for an upgrade.
    pub fn parse(
        &mut self,
        conn: &mut Connection,
        headers: &mut Headers,
        input: &[u8],
    ) -> Result<ParseStatus, ParseError> {
        match self.state {
            ParseState::Body => return Ok(ParseStatus::Ok),
            ParseState::Complete => return Ok(ParseStatus::Complete),
            ParseState::Error => return Err(ParseError::HeadersTooLarge),
            _ => {}
        }

        for (i, c) in input.iter().copied().enumerate() {
            if self.head_bytes >= MAX_REQUEST_HEADER_BYTES {
                return self.fail(ParseError::HeadersTooLarge);
            }
            self.head_bytes += 1;

            match self.state {
                ParseState::Method => {
                    if c == SP {
                        if self.method.is_empty() {
                            return self.fail(ParseError::EmptyMethod);
                        }
                        conn.method = Method::from_bytes(&self.method);
                        self.state = ParseState::Url;
                    } else if !is_token_char(c) {
                        return self.fail(ParseError::InvalidMethod);
                    } else if self.method.try_push(c).is_err() {
                        return self.fail(ParseError::MethodTooLong);
                    }
                }
                ParseState::Url => match c {
                    SP => {
                        if self.url.is_empty() {
                            return self.fail(ParseError::EmptyUrl);
                        }
                        conn.url_len = self.url.len() as u8;
                        self.state = ParseState::Version;
                    }
                    CR | LF => return self.fail(ParseError::IncompleteRequestLine),
                    _ => {
                        if self.url.try_push(c).is_err() {
                            return self.fail(ParseError::UrlTooLong);
                        }
                    }
                },
                ParseState::Version => {
                    if c == LF {
                        self.state = ParseState::HeaderKey;
                        self.key.clear();
                    }
                }
                ParseState::HeaderKey => match c {
                    CR if self.key.is_empty() => self.state = ParseState::HeadersComplete,
                    LF if self.key.is_empty() => return Ok(self.finish(conn, i)),
                    CR | LF => return self.fail(ParseError::HeaderKeyTooLong),
                    COLON => {
                        if self.key.is_empty() {
                            return self.fail(ParseError::EmptyHeaderKey);
                        }
                        self.value.clear();
                        self.value_started = false;
                        self.value_done = false;
                        self.state = ParseState::HeaderValue;
                    }
                    _ if is_whitespace(c) => {}
                    _ => {
                        if self.key.try_push(c).is_err() {
                            return self.fail(ParseError::HeaderKeyTooLong);
                        }
                    }
                },
                ParseState::HeaderValue => match c {
                    CR => {
                        if !self.value_done {
                            self.process_header(conn, headers);
                            self.value_done = true;
                        }
                    }
                    LF => {
                        if !self.value_done {
                            self.process_header(conn, headers);
                        }
                        self.key.clear();
                        self.state = ParseState::HeaderKey;
                    }
                    _ if self.value_done => {}
                    _ if !self.value_started && is_whitespace(c) => {}
                    _ => {
                        self.value_started = true;
                        if self.value.try_push(c).is_err() {
                            return self.fail(ParseError::HeaderValueTooLong);
                        }
                    }
                },
                ParseState::HeadersComplete => return Ok(self.finish(conn, i)),
                ParseState::Body | ParseState::Complete | ParseState::Error => {}
            }
        }

        Ok(ParseStatus::NeedMore)
    }

    fn fail(&mut self, err: ParseError) -> Result<ParseStatus, ParseError> {
        self.state = ParseState::Error;
        Err(err)
    }

    fn finish(&mut self, conn: &mut Connection, i: usize) -> ParseStatus {
        self.body_offset = i + 1;
        conn.header_bytes = self.head_bytes.min(u16::MAX as usize) as u16;
        conn.state = ConnState::HttpHeaders;

        if conn.method.has_body() && conn.content_length > 0 {
            conn.state = ConnState::HttpBody;
            conn.bytes_received = 0;
            self.state = ParseState::Body;
            return ParseStatus::Ok;
        }

        if conn.http.is_websocket && conn.http.upgrade_ws {
            conn.state = ConnState::WebSocket;
        }

        self.state = ParseState::Complete;
        ParseStatus::Complete
    }

    fn process_header(&mut self, conn: &mut Connection, headers: &mut Headers) {
        if self.value.is_empty() {
            return;
        }

        let value = &self.value[..];
        match RequestHeader::from(&self.key[..]) {
            RequestHeader::ContentLength => conn.content_length = parse_content_length(value),
            RequestHeader::Connection => conn.http.keep_alive = parse_keep_alive(value),
            RequestHeader::Upgrade => {
                if is_websocket_upgrade(value) {
                    conn.http.upgrade_ws = true;
                }
            }
            RequestHeader::SecWebSocketKey => {
                if value.len() <= MAX_WS_KEY_LEN && headers.set_ws_key(value) {
                    conn.http.is_websocket = true;
                }
            }
            _ => {}
        }

        if !headers.insert(&self.key, value) {
            trace!("header store full, dropping header");
        }
    }
}

impl Default for ParserContext {
    fn default() -> Self {
        Self::new()
    }
}
