//! xtext encoding (RFC 1891).
//!
//! Attribute values in XFORWARD/XCLIENT commands carry arbitrary bytes;
//! anything outside the printable US-ASCII range, plus `+` and `=`, is
//! transmitted as `+HH` (uppercase hex).

const fn is_xchar(byte: u8) -> bool {
    byte >= b'!' && byte <= b'~' && byte != b'+' && byte != b'='
}

const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Encodes a value for transmission inside an XFORWARD/XCLIENT attribute.
#[must_use]
pub fn encode(input: &str) -> String {
    use core::fmt::Write;

    let mut out = String::with_capacity(input.len());

    for &byte in input.as_bytes() {
        if is_xchar(byte) {
            out.push(byte as char);
        } else {
            let _ = write!(out, "+{byte:02X}");
        }
    }

    out
}

/// Decodes an xtext-encoded attribute value.
///
/// Malformed escapes (a `+` not followed by two uppercase hex digits) are
/// passed through untouched, matching the lenient behavior expected of a
/// receiving server.
#[must_use]
pub fn decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'+'
            && idx + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[idx + 1]), hex_value(bytes[idx + 2]))
        {
            out.push(hi << 4 | lo);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
