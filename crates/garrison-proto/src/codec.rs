//! Length-prefixed binary primitives and content codecs.
//!
//! Everything the group data extension and the persisted state snapshots
//! put on the wire goes through these helpers: byte fields carry a 4-byte
//! big-endian length, string arrays carry a 4-byte count followed by
//! length-prefixed UTF-8. Decoding is strict — a declared length that
//! overruns the remaining input fails with [`CodecError::ShortInput`].
//! Encoding is total.

use thiserror::Error;

/// Errors from the binary codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("short input: need {needed} more bytes, {remaining} remaining")]
    ShortInput { needed: usize, remaining: usize },

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("invalid base64 content: {0}")]
    InvalidBase64(String),

    #[error("invalid hex content: {0}")]
    InvalidHex(String),
}

/// Append `bytes` with a 4-byte big-endian length prefix.
pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Append a UTF-8 string with a 4-byte big-endian length prefix.
pub fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

/// Append a string array: 4-byte count, then each string length-prefixed.
pub fn put_str_array(out: &mut Vec<u8>, items: &[String]) {
    out.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        put_str(out, item);
    }
}

/// Append an optional fixed-size field as length-prefixed bytes.
///
/// Absent values encode as length 0.
pub fn put_opt_bytes(out: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => put_bytes(out, b),
        None => out.extend_from_slice(&0u32.to_be_bytes()),
    }
}

/// Forward-only reader over a byte slice.
///
/// Every read checks the remaining length first, so a truncated or
/// corrupted buffer surfaces as [`CodecError::ShortInput`] rather than a
/// panic.
pub struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// True when the whole input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::ShortInput {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read a 4-byte big-endian u32.
    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a length-prefixed byte field.
    pub fn bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Read exactly `n` raw bytes without a length prefix.
    pub fn fixed(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a string array (4-byte count, then length-prefixed strings).
    pub fn str_array(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.u32()? as usize;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(self.string()?);
        }
        Ok(items)
    }

    /// Read an optional fixed-size field encoded as length-prefixed bytes.
    ///
    /// Length 0 decodes as `None`; any other length is returned as-is for
    /// the caller to validate.
    pub fn opt_bytes(&mut self) -> Result<Option<&'a [u8]>, CodecError> {
        let raw = self.bytes()?;
        if raw.is_empty() {
            Ok(None)
        } else {
            Ok(Some(raw))
        }
    }
}

/// Content encoding used for event payloads.
///
/// Key package events historically shipped hex content without an encoding
/// tag, so hex is the default when the tag is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    Base64,
    #[default]
    Hex,
}

impl ContentEncoding {
    /// Parse an encoding tag value. Unknown values fall back to hex.
    pub fn from_tag(value: Option<&str>) -> Self {
        match value {
            Some("base64") => ContentEncoding::Base64,
            _ => ContentEncoding::Hex,
        }
    }

    /// Tag value for this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Base64 => "base64",
            ContentEncoding::Hex => "hex",
        }
    }

    /// Encode raw bytes as event content.
    pub fn encode(&self, bytes: &[u8]) -> String {
        match self {
            ContentEncoding::Base64 => encode_base64(bytes),
            ContentEncoding::Hex => hex::encode(bytes),
        }
    }

    /// Decode event content back to raw bytes.
    pub fn decode(&self, content: &str) -> Result<Vec<u8>, CodecError> {
        match self {
            ContentEncoding::Base64 => decode_base64(content),
            ContentEncoding::Hex => {
                hex::decode(content).map_err(|e| CodecError::InvalidHex(e.to_string()))
            }
        }
    }
}

/// Standard base64 encode for event content.
pub fn encode_base64(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(bytes)
}

/// Standard base64 decode for event content.
pub fn decode_base64(content: &str) -> Result<Vec<u8>, CodecError> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD
        .decode(content)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"hello");
        put_bytes(&mut buf, b"");

        let mut r = Reader::new(&buf);
        assert_eq!(r.bytes().unwrap(), b"hello");
        assert_eq!(r.bytes().unwrap(), b"");
        assert!(r.is_empty());
    }

    #[test]
    fn test_str_array_roundtrip() {
        let items = vec!["wss://relay.one".to_string(), "wss://relay.two".to_string()];
        let mut buf = Vec::new();
        put_str_array(&mut buf, &items);

        let mut r = Reader::new(&buf);
        assert_eq!(r.str_array().unwrap(), items);
    }

    #[test]
    fn test_empty_str_array() {
        let mut buf = Vec::new();
        put_str_array(&mut buf, &[]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.str_array().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_opt_bytes_absent() {
        let mut buf = Vec::new();
        put_opt_bytes(&mut buf, None);

        let mut r = Reader::new(&buf);
        assert_eq!(r.opt_bytes().unwrap(), None);
    }

    #[test]
    fn test_opt_bytes_present() {
        let mut buf = Vec::new();
        put_opt_bytes(&mut buf, Some(&[7u8; 12]));

        let mut r = Reader::new(&buf);
        assert_eq!(r.opt_bytes().unwrap(), Some(&[7u8; 12][..]));
    }

    #[test]
    fn test_short_input_on_truncated_length() {
        let mut r = Reader::new(&[0, 0]);
        assert!(matches!(r.u32(), Err(CodecError::ShortInput { .. })));
    }

    #[test]
    fn test_short_input_on_overrun_declared_length() {
        // Declares 100 bytes but only 3 follow.
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);

        let mut r = Reader::new(&buf);
        let err = r.bytes().unwrap_err();
        assert_eq!(
            err,
            CodecError::ShortInput {
                needed: 100,
                remaining: 3
            }
        );
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, &[0xFF, 0xFE]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.string(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_content_encoding_defaults_to_hex() {
        assert_eq!(ContentEncoding::from_tag(None), ContentEncoding::Hex);
        assert_eq!(
            ContentEncoding::from_tag(Some("base64")),
            ContentEncoding::Base64
        );
        assert_eq!(
            ContentEncoding::from_tag(Some("unknown")),
            ContentEncoding::Hex
        );
    }

    #[test]
    fn test_content_encoding_roundtrip() {
        let data = vec![0u8, 1, 254, 255];
        for enc in [ContentEncoding::Base64, ContentEncoding::Hex] {
            let s = enc.encode(&data);
            assert_eq!(enc.decode(&s).unwrap(), data);
        }
    }
}
