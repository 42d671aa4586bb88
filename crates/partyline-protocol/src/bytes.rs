//! Big-endian primitive reading and writing.
//!
//! [`ByteReader`] walks a borrowed slice and reports
//! [`ProtocolError::TruncatedFrame`] the moment it runs out, which is what
//! lets the stream reader tell "incomplete" apart from "corrupt".
//! [`WriteExt`] adds the matching writers to `Vec<u8>`. Both are public so
//! user [`Message`](crate::Message) codecs can reuse the same encodings.

use crate::error::ProtocolError;

/// A cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_be {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Reads a big-endian `", stringify!($ty), "`.")]
            pub fn $name(&mut self) -> Result<$ty, ProtocolError> {
                Ok(<$ty>::from_be_bytes(self.read_array()?))
            }
        )*
    };
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Takes the next `len` bytes as a slice.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::TruncatedFrame {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let buf: &'a [u8] = self.buf;
        let bytes = &buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Takes the next `N` bytes as an array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, ProtocolError> {
        Ok(self.read_u8()? as i8)
    }

    /// Reads a one-byte boolean. Only `0` and `1` are accepted.
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Malformed(format!("invalid bool byte {other}"))),
        }
    }

    read_be! {
        read_u16 => u16,
        read_i16 => i16,
        read_u32 => u32,
        read_i32 => i32,
        read_u64 => u64,
        read_i64 => i64,
        read_u128 => u128,
        read_f32 => f32,
        read_f64 => f64,
    }

    /// Reads a `u32` length prefix followed by that many UTF-8 bytes.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Big-endian writers for `Vec<u8>`.
pub trait WriteExt {
    fn put_u8(&mut self, v: u8);
    fn put_i8(&mut self, v: i8);
    fn put_bool(&mut self, v: bool);
    fn put_u16(&mut self, v: u16);
    fn put_i16(&mut self, v: i16);
    fn put_u32(&mut self, v: u32);
    fn put_i32(&mut self, v: i32);
    fn put_u64(&mut self, v: u64);
    fn put_i64(&mut self, v: i64);
    fn put_u128(&mut self, v: u128);
    fn put_f32(&mut self, v: f32);
    fn put_f64(&mut self, v: f64);
    /// Writes a `u32` byte length then the UTF-8 bytes.
    fn put_str(&mut self, v: &str);
}

impl WriteExt for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_i8(&mut self, v: i8) {
        self.push(v as u8);
    }

    fn put_bool(&mut self, v: bool) {
        self.push(u8::from(v));
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i16(&mut self, v: i16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u128(&mut self, v: u128) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_str(&mut self, v: &str) {
        self.put_u32(v.len() as u32);
        self.extend_from_slice(v.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_end_is_truncated() {
        let mut reader = ByteReader::new(&[0, 1]);
        let err = reader.read_u32().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TruncatedFrame {
                needed: 4,
                remaining: 2
            }
        ));
        // A failed read consumes nothing.
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut out = Vec::new();
        out.put_u32(0x0102_0304);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(ByteReader::new(&out).read_u32().unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_read_bool_rejects_other_bytes() {
        assert!(ByteReader::new(&[1]).read_bool().unwrap());
        assert!(!ByteReader::new(&[0]).read_bool().unwrap());
        assert!(matches!(
            ByteReader::new(&[2]).read_bool(),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_read_string_empty_and_non_empty() {
        let mut out = Vec::new();
        out.put_str("");
        out.put_str("héllo");
        let mut reader = ByteReader::new(&out);
        assert_eq!(reader.read_string().unwrap(), "");
        assert_eq!(reader.read_string().unwrap(), "héllo");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_read_string_invalid_utf8() {
        let mut out = Vec::new();
        out.put_u32(2);
        out.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            ByteReader::new(&out).read_string(),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_floats_roundtrip_bits() {
        let mut out = Vec::new();
        out.put_f32(-1.5);
        out.put_f64(f64::MAX);
        let mut reader = ByteReader::new(&out);
        assert_eq!(reader.read_f32().unwrap(), -1.5);
        assert_eq!(reader.read_f64().unwrap(), f64::MAX);
    }
}
