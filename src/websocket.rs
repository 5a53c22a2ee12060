//! WebSocket (RFC 6455) framing.
//!
//! Once a connection is upgraded, every read is handed to that connection's [`FrameContext`].
//! The framer is a byte level state machine, so frames may be split across reads at any point,
//! header bytes included. Payloads are unmasked in place and accumulated into a buffer that
//! keeps its capacity from one frame to the next.
//!
//! Control frames are answered by the framer itself through a [`FrameSink`]. A PING is answered
//! with a PONG carrying the same payload and a CLOSE with an empty CLOSE. Data frames are
//! reported as [`FrameResult::Complete`] and their payload read with
//! [`FrameContext::payload`].
//!
//! ```
//! use evhttpd::connection::Connection;
//! use evhttpd::websocket::{FrameContext, FrameResult, FrameSink, Opcode, WebsocketError};
//!
//! struct NoReplies;
//!
//! impl FrameSink for NoReplies {
//!     fn send_frame(&mut self, _: Opcode, _: &[u8]) -> Result<(), WebsocketError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut conn = Connection::new();
//! let mut framer = FrameContext::new();
//! // a masked text frame carrying "Hello"
//! let mut wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
//!
//! let (result, consumed) = framer.process(&mut conn, &mut wire, &mut NoReplies).unwrap();
//! assert_eq!(result, FrameResult::Complete);
//! assert_eq!(consumed, 11);
//! assert_eq!(framer.payload(), b"Hello");
//! ```

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use base64ct::{Base64, Encoding};
use sha1::{Digest, Sha1};

use crate::config::{WS_DEFAULT_BUFFER, WS_MAX_PAYLOAD};
use crate::connection::Connection;

const SEC_WEBSOCKET_ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;
/// Largest encoded frame header.
pub const MAX_FRAME_HEADER: usize = 14;

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> Result<[u8; 28], WebsocketError> {
    let mut key_hasher = Sha1::new();
    key_hasher.update(key.as_bytes());
    key_hasher.update(SEC_WEBSOCKET_ACCEPT_MAGIC.as_bytes());
    let key_hash = key_hasher.finalize();

    let mut key_b64_buff = [0u8; 28];
    if Base64::encode(&key_hash, &mut key_b64_buff).is_err() {
        return Err(WebsocketError::Encoding);
    }

    Ok(key_b64_buff)
}

/// WebsocketError contains the errors that may be returned while handling a websocket connection.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum WebsocketError {
    /// Reserved or unknown opcode.
    InvalidOpcode(u8),
    /// A control frame without the FIN bit.
    FragmentedControlFrame,
    /// A control frame with more than 125 bytes of payload.
    ControlFrameTooLarge,
    /// A data frame payload above [`WS_MAX_PAYLOAD`].
    PayloadTooLarge(u64),
    /// A frame length outside the 16 bit range the framer handles.
    FrameTooLong(u64),
    /// The payload buffer could not grow.
    OutOfMemory,
    /// No room to queue an outbound frame.
    QueueFull,
    /// The accept key could not be encoded.
    Encoding,
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Close, Ping or Pong.
    pub fn is_control(&self) -> bool {
        (*self as u8) & 0x08 != 0
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WebsocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(WebsocketError::InvalidOpcode(value)),
        }
    }
}

/// Framer progress within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum FrameState {
    Opcode,
    Length,
    LengthExt16,
    LengthExt64,
    Mask,
    Payload,
    Complete,
}

/// What a call to [`FrameContext::process`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameResult {
    /// A control frame was handled. Keep processing the remaining input.
    Ok,
    /// The input ran out inside a frame.
    NeedMore,
    /// A data frame is complete and its payload is available.
    Complete,
    /// The peer sent CLOSE. The reply has been queued.
    Close,
}

/// Destination for frames the framer sends on its own, such as PONG replies.
pub trait FrameSink {
    /// Queue one frame.
    fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WebsocketError>;
}

/// Persistent framer state for one connection.
#[derive(Debug)]
pub struct FrameContext {
    state: FrameState,
    opcode: Opcode,
    ext_needed: u8,
    ext_len: u64,
    mask_read: u8,
    payload_len: usize,
    received: usize,
    payload: Vec<u8>,
    control: ArrayVec<u8, MAX_CONTROL_PAYLOAD>,
}

impl FrameContext {
    /// A framer with a payload buffer of [`WS_DEFAULT_BUFFER`] bytes.
    pub fn new() -> Self {
        FrameContext {
            state: FrameState::Opcode,
            opcode: Opcode::Continuation,
            ext_needed: 0,
            ext_len: 0,
            mask_read: 0,
            payload_len: 0,
            received: 0,
            payload: Vec::with_capacity(WS_DEFAULT_BUFFER),
            control: ArrayVec::new(),
        }
    }

    /// Return to the start of a frame, keeping the payload buffer's capacity.
    pub fn reset(&mut self) {
        self.state = FrameState::Opcode;
        self.opcode = Opcode::Continuation;
        self.ext_needed = 0;
        self.ext_len = 0;
        self.mask_read = 0;
        self.payload_len = 0;
        self.received = 0;
        self.payload.clear();
        self.control.clear();
    }

    /// Current state.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Opcode of the current (or just completed) frame.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Payload of the most recently completed data frame.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Current capacity of the payload buffer.
    pub fn capacity(&self) -> usize {
        self.payload.capacity()
    }

    /// Feed `data` to the framer, unmasking payload bytes in place.
    ///
    /// Returns the result together with the number of bytes consumed. Processing stops at the
    /// end of each frame, so callers loop over the remaining input until it is consumed or
    /// [`FrameResult::NeedMore`] is returned.
    pub fn process<S: FrameSink>(
        &mut self,
        conn: &mut Connection,
        data: &mut [u8],
        sink: &mut S,
    ) -> Result<(FrameResult, usize), WebsocketError> {
        if self.state == FrameState::Complete {
            self.reset();
        }

        let mut i = 0;
        while i < data.len() {
            match self.state {
                FrameState::Opcode => {
                    let b = data[i];
                    i += 1;

                    let fin = b & 0x80 != 0;
                    let raw = b & 0x0F;
                    let opcode = Opcode::try_from(raw)?;
                    if opcode.is_control() && !fin {
                        return Err(WebsocketError::FragmentedControlFrame);
                    }

                    conn.ws.fin = fin;
                    conn.ws.opcode = raw;
                    if !opcode.is_control() {
                        conn.ws.fragmented = !fin;
                    }
                    self.opcode = opcode;
                    self.state = FrameState::Length;
                }
                FrameState::Length => {
                    let b = data[i];
                    i += 1;

                    conn.ws.masked = b & 0x80 != 0;
                    match b & 0x7F {
                        126 => {
                            self.ext_needed = 2;
                            self.ext_len = 0;
                            self.state = FrameState::LengthExt16;
                        }
                        127 => {
                            self.ext_needed = 8;
                            self.ext_len = 0;
                            self.state = FrameState::LengthExt64;
                        }
                        len => {
                            self.set_length(conn, len.into())?;
                            if let Some(result) = self.after_length(conn, sink) {
                                return Ok((result, i));
                            }
                        }
                    }
                }
                FrameState::LengthExt16 | FrameState::LengthExt64 => {
                    self.ext_len = (self.ext_len << 8) | u64::from(data[i]);
                    self.ext_needed -= 1;
                    i += 1;

                    if self.ext_needed == 0 {
                        self.set_length(conn, self.ext_len)?;
                        if let Some(result) = self.after_length(conn, sink) {
                            return Ok((result, i));
                        }
                    }
                }
                FrameState::Mask => {
                    conn.ws_mask_key[self.mask_read as usize] = data[i];
                    self.mask_read += 1;
                    i += 1;

                    if self.mask_read == 4 {
                        if self.payload_len == 0 {
                            return Ok((self.complete(sink), i));
                        }
                        self.state = FrameState::Payload;
                    }
                }
                FrameState::Payload => {
                    if self.received == 0 && !self.opcode.is_control() {
                        self.reserve_payload()?;
                    }

                    let take = (self.payload_len - self.received).min(data.len() - i);
                    let chunk = &mut data[i..i + take];
                    if conn.ws.masked {
                        apply_mask(chunk, conn.ws_mask_key, self.received);
                    }

                    if self.opcode.is_control() {
                        // length checked against the control limit already
                        let _ = self.control.try_extend_from_slice(chunk);
                    } else {
                        self.payload.extend_from_slice(chunk);
                    }

                    self.received += take;
                    conn.ws_payload_read = self.received as u16;
                    i += take;

                    if self.received == self.payload_len {
                        return Ok((self.complete(sink), i));
                    }
                }
                FrameState::Complete => break,
            }
        }

        Ok((FrameResult::NeedMore, i))
    }

    fn set_length(&mut self, conn: &mut Connection, len: u64) -> Result<(), WebsocketError> {
        if self.opcode.is_control() && len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WebsocketError::ControlFrameTooLarge);
        }
        if len > u64::from(u16::MAX) {
            return Err(WebsocketError::FrameTooLong(len));
        }

        let len = len as usize;
        self.payload_len = len;
        self.received = 0;
        conn.ws_payload_len = len as u16;
        conn.ws_payload_read = 0;
        Ok(())
    }

    /// Size the payload buffer for the current data frame, once its first payload byte is in.
    fn reserve_payload(&mut self) -> Result<(), WebsocketError> {
        if self.payload_len > WS_MAX_PAYLOAD {
            return Err(WebsocketError::PayloadTooLarge(self.payload_len as u64));
        }
        self.payload
            .try_reserve(self.payload_len)
            .map_err(|_| WebsocketError::OutOfMemory)
    }

    fn after_length<S: FrameSink>(
        &mut self,
        conn: &Connection,
        sink: &mut S,
    ) -> Option<FrameResult> {
        if conn.ws.masked {
            self.mask_read = 0;
            self.state = FrameState::Mask;
            None
        } else if self.payload_len == 0 {
            Some(self.complete(sink))
        } else {
            self.state = FrameState::Payload;
            None
        }
    }

    fn complete<S: FrameSink>(&mut self, sink: &mut S) -> FrameResult {
        self.state = FrameState::Complete;

        match self.opcode {
            Opcode::Close => {
                if sink.send_frame(Opcode::Close, &[]).is_err() {
                    warn!("unable to queue close reply");
                }
                FrameResult::Close
            }
            Opcode::Ping => {
                if sink.send_frame(Opcode::Pong, &self.control).is_err() {
                    warn!("unable to queue pong");
                }
                FrameResult::Ok
            }
            Opcode::Pong => FrameResult::Ok,
            _ => FrameResult::Complete,
        }
    }
}

impl Default for FrameContext {
    fn default() -> Self {
        Self::new()
    }
}

/// XOR `payload` with `key`, where `offset` is the position of `payload[0]` within the frame's
/// payload. Bytes are handled one at a time until both the data address and the key rotation
/// are word aligned, then eight and four bytes at a time.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4], offset: usize) {
    let base = payload.as_ptr() as usize;
    let mut i = 0;

    while i < payload.len() && ((base + i) & 3 != 0 || (offset + i) & 3 != 0) {
        payload[i] ^= key[(offset + i) & 3];
        i += 1;
    }

    let key32 = u32::from_ne_bytes(key);
    let key64 = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = payload[i..].chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ key64).to_ne_bytes());
    }

    let rest = chunks.into_remainder();
    let mut words = rest.chunks_exact_mut(4);
    for chunk in &mut words {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u32::from_ne_bytes(word) ^ key32).to_ne_bytes());
    }

    for (j, b) in words.into_remainder().iter_mut().enumerate() {
        *b ^= key[j & 3];
    }
}

/// Encode a server frame header (FIN set) into `dest`, returning its length. Payloads above
/// 65535 bytes are not supported. With `masked` a zero masking key is appended.
pub fn encode_header(
    opcode: Opcode,
    payload_len: usize,
    masked: bool,
    dest: &mut [u8; MAX_FRAME_HEADER],
) -> Result<usize, WebsocketError> {
    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
        return Err(WebsocketError::ControlFrameTooLarge);
    }

    dest[0] = 0x80 | opcode as u8;
    let mask_bit = if masked { 0x80 } else { 0 };

    let mut len = 2;
    if payload_len < 126 {
        dest[1] = mask_bit | payload_len as u8;
    } else if payload_len <= u16::MAX as usize {
        // 16 bit length
        dest[1] = mask_bit | 126;
        [dest[2], dest[3]] = (payload_len as u16).to_be_bytes();
        len = 4;
    } else {
        return Err(WebsocketError::FrameTooLong(payload_len as u64));
    }

    if masked {
        dest[len..len + 4].fill(0);
        len += 4;
    }

    Ok(len)
}

/// Build a CLOSE payload: the status code in network order followed by up to 123 bytes of
/// reason. A code of 0 produces an empty payload.
pub fn close_payload(
    code: u16,
    reason: &str,
    dest: &mut [u8; MAX_CONTROL_PAYLOAD],
) -> usize {
    if code == 0 {
        return 0;
    }

    [dest[0], dest[1]] = code.to_be_bytes();
    let reason = &reason.as_bytes()[..reason.len().min(MAX_CONTROL_PAYLOAD - 2)];
    dest[2..2 + reason.len()].copy_from_slice(reason);
    2 + reason.len()
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;
    use std::vec::Vec;

    use super::*;

    #[derive(Default)]
    struct Replies(Vec<(Opcode, Vec<u8>)>);

    impl FrameSink for Replies {
        fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WebsocketError> {
            self.0.push((opcode, payload.to_vec()));
            Ok(())
        }
    }

    fn masked_frame(first: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = vec![first];
        if payload.len() < 126 {
            out.push(0x80 | payload.len() as u8);
        } else {
            out.push(0x80 | 126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    #[test]
    fn test_accept_key() {
        let accept = accept_key("dGhlIHNhbXBsZSBub25jZQ==").unwrap();
        assert_eq!(&accept, b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_masked_hello() {
        let mut conn = Connection::new();
        let mut framer = FrameContext::new();
        let mut replies = Replies::default();
        let mut wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];

        let res = framer.process(&mut conn, &mut wire, &mut replies);
        assert_eq!(res, Ok((FrameResult::Complete, 11)));
        assert_eq!(framer.payload(), b"Hello");
        assert_eq!(framer.opcode(), Opcode::Text);
        assert_eq!(conn.ws_mask_key, [0x37, 0xfa, 0x21, 0x3d]);
        assert!(conn.ws.fin);
        assert!(replies.0.is_empty());
    }

    #[test]
    fn test_split_at_every_byte() {
        let payload: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        let wire = masked_frame(0x82, &payload, [1, 2, 3, 4]);

        let mut conn = Connection::new();
        let mut framer = FrameContext::new();
        let mut replies = Replies::default();

        let mut last = FrameResult::NeedMore;
        for b in wire.iter() {
            let mut one = [*b];
            let (res, consumed) = framer.process(&mut conn, &mut one, &mut replies).unwrap();
            assert_eq!(consumed, 1);
            last = res;
        }

        assert_eq!(last, FrameResult::Complete);
        assert_eq!(framer.payload(), &payload[..]);
        assert_eq!(framer.opcode(), Opcode::Binary);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut wire = masked_frame(0x81, b"one", [9, 8, 7, 6]);
        wire.extend(masked_frame(0x81, b"second", [5, 4, 3, 2]));

        let mut conn = Connection::new();
        let mut framer = FrameContext::new();
        let mut replies = Replies::default();

        let (res, used) = framer.process(&mut conn, &mut wire, &mut replies).unwrap();
        assert_eq!(res, FrameResult::Complete);
        assert_eq!(framer.payload(), b"one");

        let (res, rest) = framer
            .process(&mut conn, &mut wire[used..], &mut replies)
            .unwrap();
        assert_eq!(res, FrameResult::Complete);
        assert_eq!(used + rest, wire.len());
        assert_eq!(framer.payload(), b"second");
    }

    #[test]
    fn test_ping_gets_pong() {
        let mut wire = masked_frame(0x89, b"are you there", [0xaa, 0xbb, 0xcc, 0xdd]);
        let mut conn = Connection::new();
        let mut framer = FrameContext::new();
        let mut replies = Replies::default();

        let res = framer.process(&mut conn, &mut wire, &mut replies);
        assert_eq!(res, Ok((FrameResult::Ok, wire.len())));
        assert_eq!(replies.0, [(Opcode::Pong, b"are you there".to_vec())]);
    }

    #[test]
    fn test_close_gets_close() {
        let mut wire = masked_frame(0x88, &[0x03, 0xe8], [1, 1, 1, 1]);
        let mut conn = Connection::new();
        let mut framer = FrameContext::new();
        let mut replies = Replies::default();

        let res = framer.process(&mut conn, &mut wire, &mut replies);
        assert_eq!(res, Ok((FrameResult::Close, wire.len())));
        assert_eq!(replies.0, [(Opcode::Close, Vec::new())]);
    }

    #[test]
    fn test_zero_length_frames() {
        let mut conn = Connection::new();
        let mut framer = FrameContext::new();
        let mut replies = Replies::default();

        let mut unmasked = [0x81, 0x00];
        let res = framer.process(&mut conn, &mut unmasked, &mut replies);
        assert_eq!(res, Ok((FrameResult::Complete, 2)));
        assert!(framer.payload().is_empty());

        let mut masked = [0x82, 0x80, 1, 2, 3, 4];
        let res = framer.process(&mut conn, &mut masked, &mut replies);
        assert_eq!(res, Ok((FrameResult::Complete, 6)));

        let mut ping = [0x89, 0x00];
        let res = framer.process(&mut conn, &mut ping, &mut replies);
        assert_eq!(res, Ok((FrameResult::Ok, 2)));
        assert_eq!(replies.0, [(Opcode::Pong, Vec::new())]);
    }

    #[test]
    fn test_protocol_errors() {
        let mut conn = Connection::new();
        let mut replies = Replies::default();

        for op in [0x83u8, 0x87, 0x8B, 0x8F] {
            let mut framer = FrameContext::new();
            let mut wire = [op, 0x00];
            assert_eq!(
                framer.process(&mut conn, &mut wire, &mut replies),
                Err(WebsocketError::InvalidOpcode(op & 0x0F))
            );
        }

        let mut framer = FrameContext::new();
        let mut wire = [0x09, 0x00];
        assert_eq!(
            framer.process(&mut conn, &mut wire, &mut replies),
            Err(WebsocketError::FragmentedControlFrame)
        );

        let mut framer = FrameContext::new();
        let mut wire = [0x89, 126, 0x00, 0x7e];
        assert_eq!(
            framer.process(&mut conn, &mut wire, &mut replies),
            Err(WebsocketError::ControlFrameTooLarge)
        );

        let mut framer = FrameContext::new();
        let mut wire = [0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0];
        assert_eq!(
            framer.process(&mut conn, &mut wire, &mut replies),
            Err(WebsocketError::FrameTooLong(65536))
        );
    }

    #[test]
    fn test_length_limits() {
        let mut conn = Connection::new();
        let mut replies = Replies::default();

        // a 16 bit length at its maximum is a valid header
        let mut framer = FrameContext::new();
        let mut wire = [0x82, 0x80 | 126, 0xFF, 0xFF, 1, 2, 3, 4];
        assert_eq!(
            framer.process(&mut conn, &mut wire, &mut replies),
            Ok((FrameResult::NeedMore, 8))
        );
        assert_eq!(framer.state(), FrameState::Payload);
        assert_eq!(conn.ws_payload_len, 0xFFFF);
        assert_eq!(framer.capacity(), WS_DEFAULT_BUFFER);

        // the payload cap applies once data arrives
        let mut data = [0u8; 16];
        assert_eq!(
            framer.process(&mut conn, &mut data, &mut replies),
            Err(WebsocketError::PayloadTooLarge(0xFFFF))
        );

        let mut framer = FrameContext::new();
        let mut wire = [0x82, 126, 0x20, 0x01];
        assert_eq!(
            framer.process(&mut conn, &mut wire, &mut replies),
            Ok((FrameResult::NeedMore, 4))
        );
        let mut data = [b'x'];
        assert_eq!(
            framer.process(&mut conn, &mut data, &mut replies),
            Err(WebsocketError::PayloadTooLarge(8193))
        );
        assert_eq!(framer.capacity(), WS_DEFAULT_BUFFER);

        // 64 bit lengths are only accepted while they fit 16 bits
        let mut framer = FrameContext::new();
        let mut wire = [0x82, 127, 0, 0, 0, 0, 0, 0, 0x20, 0x00, b'a'];
        assert_eq!(
            framer.process(&mut conn, &mut wire, &mut replies),
            Ok((FrameResult::NeedMore, 11))
        );
        assert_eq!(framer.payload(), b"a");

        let mut framer = FrameContext::new();
        let mut wire = [0x82, 127, 0, 0, 0, 1, 0, 0, 0, 0];
        assert_eq!(
            framer.process(&mut conn, &mut wire, &mut replies),
            Err(WebsocketError::FrameTooLong(1 << 32))
        );
    }

    #[test]
    fn test_buffer_capacity_persists() {
        let mut conn = Connection::new();
        let mut framer = FrameContext::new();
        let mut replies = Replies::default();

        let big = vec![b'x'; 1000];
        let mut wire = masked_frame(0x82, &big, [1, 2, 3, 4]);
        framer.process(&mut conn, &mut wire, &mut replies).unwrap();
        let grown = framer.capacity();
        assert!(grown >= 1000);

        let mut wire = masked_frame(0x81, b"small", [1, 2, 3, 4]);
        framer.process(&mut conn, &mut wire, &mut replies).unwrap();
        assert_eq!(framer.payload(), b"small");
        assert_eq!(framer.capacity(), grown);
    }

    #[test]
    fn test_apply_mask_offsets() {
        let key = [0x11, 0x22, 0x33, 0x44];
        let original: Vec<u8> = (0..67u8).collect();

        let mut whole = original.clone();
        apply_mask(&mut whole, key, 0);
        for (i, b) in whole.iter().enumerate() {
            assert_eq!(*b, original[i] ^ key[i % 4]);
        }

        // masking in pieces with carried offsets matches masking in one go
        let mut pieces = original.clone();
        let (a, rest) = pieces.split_at_mut(3);
        let (b, c) = rest.split_at_mut(30);
        apply_mask(a, key, 0);
        apply_mask(b, key, 3);
        apply_mask(c, key, 33);
        assert_eq!(pieces, whole);
    }

    #[test]
    fn test_encode_header() {
        let mut dest = [0u8; MAX_FRAME_HEADER];

        assert_eq!(encode_header(Opcode::Text, 5, false, &mut dest), Ok(2));
        assert_eq!(&dest[..2], &[0x81, 0x05]);

        assert_eq!(encode_header(Opcode::Binary, 300, false, &mut dest), Ok(4));
        assert_eq!(&dest[..4], &[0x82, 126, 0x01, 0x2c]);

        assert_eq!(encode_header(Opcode::Binary, 125, true, &mut dest), Ok(6));
        assert_eq!(&dest[..6], &[0x82, 0x80 | 125, 0, 0, 0, 0]);

        assert_eq!(
            encode_header(Opcode::Binary, 70_000, false, &mut dest),
            Err(WebsocketError::FrameTooLong(70_000))
        );
        assert_eq!(
            encode_header(Opcode::Ping, 126, false, &mut dest),
            Err(WebsocketError::ControlFrameTooLarge)
        );
    }

    #[test]
    fn test_close_payload() {
        let mut dest = [0u8; MAX_CONTROL_PAYLOAD];
        let n = close_payload(1000, "bye", &mut dest);
        assert_eq!(&dest[..n], &[0x03, 0xe8, b'b', b'y', b'e']);

        assert_eq!(close_payload(0, "ignored", &mut dest), 0);

        let long = "r".repeat(200);
        assert_eq!(close_payload(1001, &long, &mut dest), MAX_CONTROL_PAYLOAD);
    }
}
