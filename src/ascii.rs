pub(crate) const CR: u8 = 13;
pub(crate) const LF: u8 = 10;
pub(crate) const SP: u8 = 32;
pub(crate) const HTAB: u8 = 9;
pub(crate) const COLON: u8 = 58;
pub(crate) const ZERO: u8 = 48;
pub(crate) const CRLF: &[u8] = b"\r\n";

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// ASCII case folding for letters. Non letters are passed through the same bit flip, which is
/// harmless for the header and keyword comparisons this is used for.
#[inline]
pub(crate) fn fold(c: u8) -> u8 {
    c | 0x20
}

/// Case insensitive comparison of two byte strings.
pub(crate) fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| fold(*x) == fold(*y))
}

/// Case insensitive prefix check.
pub(crate) fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && eq_ignore_case(&data[..prefix.len()], prefix)
}

#[inline]
pub(crate) fn is_whitespace(c: u8) -> bool {
    c == SP || c == HTAB
}

/// RFC 9110 `tchar`.
pub(crate) fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

pub(crate) fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - ZERO),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// A right aligned ASCII rendering of an unsigned integer, in decimal or lowercase hex.
pub(crate) struct AsciiInt {
    buf: [u8; 20],
    start: usize,
}

impl AsciiInt {
    fn render(mut value: u64, radix: u64) -> Self {
        let mut buf = [SP; 20];
        let mut start = buf.len();

        loop {
            start -= 1;
            buf[start] = HEX_DIGITS[(value % radix) as usize];
            value /= radix;
            if value == 0 {
                break;
            }
        }

        AsciiInt { buf, start }
    }

    pub(crate) fn hex(value: u64) -> Self {
        Self::render(value, 16)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }
}

impl From<u64> for AsciiInt {
    fn from(value: u64) -> Self {
        Self::render(value, 10)
    }
}

impl From<u32> for AsciiInt {
    fn from(value: u32) -> Self {
        Self::render(value.into(), 10)
    }
}

impl From<usize> for AsciiInt {
    fn from(value: usize) -> Self {
        Self::render(value as u64, 10)
    }
}
