use arrayvec::{ArrayString, ArrayVec};

use crate::ascii::{eq_ignore_case, fold, starts_with_ignore_case, ZERO};
use crate::config::{HEADER_STORE_SIZE, MAX_STORED_HEADERS, MAX_WS_KEY_LEN};

/// Host
pub const REQ_HEAD_HOST: &str = "Host";
/// Content-Length
pub const REQ_HEAD_CONTENT_LENGTH: &str = "Content-Length";
/// Content-Type
pub const REQ_HEAD_CONTENT_TYPE: &str = "Content-Type";
/// Connection
pub const REQ_HEAD_CONNECTION: &str = "Connection";
/// Cookie
pub const REQ_HEAD_COOKIE: &str = "Cookie";
/// Upgrade
pub const REQ_HEAD_UPGRADE: &str = "Upgrade";
/// User-Agent
pub const REQ_HEAD_USER_AGENT: &str = "User-Agent";
/// Sec-WebSocket-Key
pub const REQ_HEAD_SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
/// Sec-WebSocket-Version
pub const REQ_HEAD_SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
/// Authorization
pub const REQ_HEAD_AUTHORIZATION: &str = "Authorization";
/// Accept
pub const REQ_HEAD_ACCEPT: &str = "Accept";
/// Origin
pub const REQ_HEAD_ORIGIN: &str = "Origin";
/// Access-Control-Request-Method
pub const REQ_HEAD_ACCESS_CONTROL_REQUEST_METHOD: &str = "Access-Control-Request-Method";
/// Access-Control-Request-Headers
pub const REQ_HEAD_ACCESS_CONTROL_REQUEST_HEADERS: &str = "Access-Control-Request-Headers";

/// Content-Type
pub const RESP_HEAD_CONTENT_TYPE: &str = "Content-Type";
/// Content-Length
pub const RESP_HEAD_CONTENT_LENGTH: &str = "Content-Length";
/// Content-Encoding
pub const RESP_HEAD_CONTENT_ENCODING: &str = "Content-Encoding";
/// Transfer-Encoding
pub const RESP_HEAD_TRANSFER_ENCODING: &str = "Transfer-Encoding";
/// Cache-Control
pub const RESP_HEAD_CACHE_CONTROL: &str = "Cache-Control";
/// WWW-Authenticate
pub const RESP_HEAD_WWW_AUTHENTICATE: &str = "WWW-Authenticate";
/// Sec-WebSocket-Accept
pub const RESP_HEAD_SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";

/// The request headers the server itself acts on or looks up often. Every other name
/// classifies as [`RequestHeader::Other`].
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestHeader {
    Host,
    ContentLength,
    ContentType,
    Connection,
    Cookie,
    Upgrade,
    UserAgent,
    SecWebSocketKey,
    SecWebSocketVersion,
    Authorization,
    Accept,
    Origin,
    AccessControlRequestMethod,
    AccessControlRequestHeaders,
    Other,
}

impl From<&[u8]> for RequestHeader {
    /// Identify a header name by its first letter, then by its length, and only then by a full
    /// case insensitive comparison.
    fn from(key: &[u8]) -> Self {
        let Some(first) = key.first() else {
            return RequestHeader::Other;
        };

        let is = |name: &str| eq_ignore_case(key, name.as_bytes());

        match (fold(*first), key.len()) {
            (b'h', 4) if is(REQ_HEAD_HOST) => RequestHeader::Host,
            (b'c', 14) if is(REQ_HEAD_CONTENT_LENGTH) => RequestHeader::ContentLength,
            (b'c', 12) if is(REQ_HEAD_CONTENT_TYPE) => RequestHeader::ContentType,
            (b'c', 10) if is(REQ_HEAD_CONNECTION) => RequestHeader::Connection,
            (b'c', 6) if is(REQ_HEAD_COOKIE) => RequestHeader::Cookie,
            (b'u', 7) if is(REQ_HEAD_UPGRADE) => RequestHeader::Upgrade,
            (b'u', 10) if is(REQ_HEAD_USER_AGENT) => RequestHeader::UserAgent,
            (b's', 17) if is(REQ_HEAD_SEC_WEBSOCKET_KEY) => RequestHeader::SecWebSocketKey,
            (b's', 21) if is(REQ_HEAD_SEC_WEBSOCKET_VERSION) => RequestHeader::SecWebSocketVersion,
            (b'a', 13) if is(REQ_HEAD_AUTHORIZATION) => RequestHeader::Authorization,
            (b'a', 6) if is(REQ_HEAD_ACCEPT) => RequestHeader::Accept,
            (b'a', 29) if is(REQ_HEAD_ACCESS_CONTROL_REQUEST_METHOD) => {
                RequestHeader::AccessControlRequestMethod
            }
            (b'a', 30) if is(REQ_HEAD_ACCESS_CONTROL_REQUEST_HEADERS) => {
                RequestHeader::AccessControlRequestHeaders
            }
            (b'o', 6) if is(REQ_HEAD_ORIGIN) => RequestHeader::Origin,
            _ => RequestHeader::Other,
        }
    }
}

/// Parse a `Content-Length` value. Digits are read up to the first non digit. More than ten
/// digits, or a value that does not fit, saturates to `u32::MAX`.
pub fn parse_content_length(value: &[u8]) -> u32 {
    if value.len() > 10 && value[..11].iter().all(u8::is_ascii_digit) {
        return u32::MAX;
    }

    let mut total: u64 = 0;
    for digit in value.iter().take_while(|c| c.is_ascii_digit()) {
        total = total * 10 + u64::from(digit - ZERO);
        if total > u64::from(u32::MAX) {
            return u32::MAX;
        }
    }

    total as u32
}

/// Decide keep-alive from a `Connection` value. Exact `keep-alive` or `close` decide directly,
/// otherwise the value is scanned for either token. Anything else keeps the connection.
pub fn parse_keep_alive(value: &[u8]) -> bool {
    const KEEP_ALIVE: &[u8] = b"keep-alive";
    const CLOSE: &[u8] = b"close";

    if eq_ignore_case(value, KEEP_ALIVE) {
        return true;
    }
    if eq_ignore_case(value, CLOSE) {
        return false;
    }

    for (i, c) in value.iter().enumerate() {
        match fold(*c) {
            b'k' if starts_with_ignore_case(&value[i..], KEEP_ALIVE) => return true,
            b'c' if starts_with_ignore_case(&value[i..], CLOSE) => return false,
            _ => {}
        }
    }

    true
}

/// Whether an `Upgrade` value asks for a WebSocket.
pub fn is_websocket_upgrade(value: &[u8]) -> bool {
    starts_with_ignore_case(value, b"websocket")
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key_start: u16,
    key_len: u8,
    value_len: u8,
}

/// Request headers captured while parsing, kept for lookup by handlers. Names and values are
/// packed into one fixed buffer. Headers that no longer fit are dropped.
#[derive(Debug)]
pub struct Headers {
    store: ArrayVec<u8, HEADER_STORE_SIZE>,
    entries: ArrayVec<Entry, MAX_STORED_HEADERS>,
    ws_key: ArrayString<MAX_WS_KEY_LEN>,
}

impl Headers {
    /// An empty header set.
    pub fn new() -> Self {
        Headers {
            store: ArrayVec::new(),
            entries: ArrayVec::new(),
            ws_key: ArrayString::new(),
        }
    }

    /// Forget every header.
    pub fn clear(&mut self) {
        self.store.clear();
        self.entries.clear();
        self.ws_key.clear();
    }

    /// Store a header. Returns false when it did not fit.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        if self.entries.is_full() || key.len() > u8::MAX as usize || value.len() > u8::MAX as usize
        {
            return false;
        }
        if self.store.remaining_capacity() < key.len() + value.len() {
            return false;
        }

        let key_start = self.store.len() as u16;
        if self.store.try_extend_from_slice(key).is_err()
            || self.store.try_extend_from_slice(value).is_err()
        {
            self.store.truncate(key_start as usize);
            return false;
        }

        self.entries.push(Entry {
            key_start,
            key_len: key.len() as u8,
            value_len: value.len() as u8,
        });
        true
    }

    /// Value of the first header named `name`, compared case insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| eq_ignore_case(key, name.as_bytes()))
            .and_then(|(_, value)| core::str::from_utf8(value).ok())
    }

    /// Stored headers in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|e| {
            let key_start = e.key_start as usize;
            let value_start = key_start + e.key_len as usize;
            (
                &self.store[key_start..value_start],
                &self.store[value_start..value_start + e.value_len as usize],
            )
        })
    }

    /// Number of stored headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no headers are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the `Sec-WebSocket-Key`. Keys that are too long, or not ASCII, are ignored.
    pub fn set_ws_key(&mut self, key: &[u8]) -> bool {
        self.ws_key.clear();
        match core::str::from_utf8(key) {
            Ok(key) => self.ws_key.try_push_str(key).is_ok(),
            Err(_) => false,
        }
    }

    /// The `Sec-WebSocket-Key` of the request, if one was accepted.
    pub fn ws_key(&self) -> Option<&str> {
        if self.ws_key.is_empty() {
            None
        } else {
            Some(self.ws_key.as_str())
        }
    }
}

impl Default for Headers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn test_identify_headers() {
        assert_eq!(RequestHeader::from(&b"host"[..]), RequestHeader::Host);
        assert_eq!(
            RequestHeader::from(&b"CONTENT-LENGTH"[..]),
            RequestHeader::ContentLength
        );
        assert_eq!(
            RequestHeader::from(&b"Content-Type"[..]),
            RequestHeader::ContentType
        );
        assert_eq!(
            RequestHeader::from(&b"connection"[..]),
            RequestHeader::Connection
        );
        assert_eq!(
            RequestHeader::from(&b"Sec-WebSocket-Key"[..]),
            RequestHeader::SecWebSocketKey
        );
        assert_eq!(
            RequestHeader::from(&b"Sec-WebSocket-Version"[..]),
            RequestHeader::SecWebSocketVersion
        );
        assert_eq!(
            RequestHeader::from(&b"Access-Control-Request-Headers"[..]),
            RequestHeader::AccessControlRequestHeaders
        );
        assert_eq!(RequestHeader::from(&b"Origin"[..]), RequestHeader::Origin);

        // same first letter and length, different name
        assert_eq!(RequestHeader::from(&b"Hist"[..]), RequestHeader::Other);
        assert_eq!(RequestHeader::from(&b"X-Forwarded"[..]), RequestHeader::Other);
        assert_eq!(RequestHeader::from(&b""[..]), RequestHeader::Other);
    }

    #[test]
    fn test_content_length() {
        assert_eq!(parse_content_length(b"0"), 0);
        assert_eq!(parse_content_length(b"15"), 15);
        assert_eq!(parse_content_length(b"4294967295"), u32::MAX);
        assert_eq!(parse_content_length(b"4294967296"), u32::MAX);
        assert_eq!(parse_content_length(b"99999999999"), u32::MAX);
        assert_eq!(parse_content_length(b"12abc"), 12);
        assert_eq!(parse_content_length(b"abc"), 0);
    }

    #[test]
    fn test_keep_alive() {
        assert!(parse_keep_alive(b"keep-alive"));
        assert!(parse_keep_alive(b"Keep-Alive"));
        assert!(!parse_keep_alive(b"close"));
        assert!(!parse_keep_alive(b"Close"));
        assert!(parse_keep_alive(b"Upgrade, keep-alive"));
        assert!(!parse_keep_alive(b"foo, close"));
        assert!(parse_keep_alive(b"Upgrade"));
    }

    #[test]
    fn test_websocket_upgrade() {
        assert!(is_websocket_upgrade(b"websocket"));
        assert!(is_websocket_upgrade(b"WebSocket"));
        assert!(!is_websocket_upgrade(b"websock"));
        assert!(!is_websocket_upgrade(b"h2c"));
    }

    #[test]
    fn test_header_store() {
        let mut headers = Headers::new();
        assert!(headers.insert(b"Host", b"example.com"));
        assert!(headers.insert(b"X-Token", b"abc123"));
        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.get("x-token"), Some("abc123"));
        assert_eq!(headers.get("missing"), None);
        assert_eq!(headers.len(), 2);

        for i in 0..MAX_STORED_HEADERS {
            headers.insert(b"X-Fill", &[b'a' + (i % 26) as u8]);
        }
        assert_eq!(headers.len(), MAX_STORED_HEADERS);
        assert!(!headers.insert(b"X-Late", b"dropped"));
        assert_eq!(headers.get("x-late"), None);

        headers.clear();
        assert!(headers.is_empty());
    }

    #[test]
    fn test_ws_key() {
        let mut headers = Headers::new();
        assert_eq!(headers.ws_key(), None);
        assert!(headers.set_ws_key(b"dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(headers.ws_key(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(!headers.set_ws_key(&[b'a'; 40]));
        assert_eq!(headers.ws_key(), None);
    }
}
