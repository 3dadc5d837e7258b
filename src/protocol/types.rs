//! Wire primitives: VarInt, UShort, Long, String
//!
//! VarInt is the standard 7-bit continuation encoding, little-endian groups,
//! at most 5 bytes. UShort and Long are big-endian. String is a VarInt byte
//! length followed by UTF-8 bytes.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Number of bytes `value` occupies when VarInt-encoded.
pub fn varint_len(value: i32) -> usize {
    let mut v = value as u32;
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Append a VarInt to `buf`.
pub fn put_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        let byte = (v as u8) & SEGMENT_BITS;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | CONTINUE_BIT);
    }
}

/// Append a big-endian unsigned short to `buf`.
pub fn put_ushort(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Append a big-endian long to `buf`.
pub fn put_long(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Append a length-prefixed UTF-8 string to `buf`.
pub fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

/// Read a VarInt from the stream, returning the value and the number of
/// bytes consumed.
pub async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<(i32, usize)> {
    let mut value: u32 = 0;
    let mut pos = 0usize;
    loop {
        let byte = r.read_u8().await?;
        value |= ((byte & SEGMENT_BITS) as u32) << (pos * 7);
        pos += 1;
        if byte & CONTINUE_BIT == 0 {
            return Ok((value as i32, pos));
        }
        if pos >= 5 {
            return Err(ProxyError::VarIntTooLong);
        }
    }
}

/// Sequential reader over a packet payload.
///
/// Mirrors the decode order of the wire primitives; every accessor fails on
/// a truncated payload instead of reading past the end.
pub struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { buf: payload, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(ProxyError::MalformedPayload(format!(
                "need {} bytes, {} left",
                n,
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn var_int(&mut self) -> Result<i32> {
        let mut value: u32 = 0;
        for pos in 0..5 {
            let byte = self.take(1)?[0];
            value |= ((byte & SEGMENT_BITS) as u32) << (pos * 7);
            if byte & CONTINUE_BIT == 0 {
                return Ok(value as i32);
            }
        }
        Err(ProxyError::VarIntTooLong)
    }

    pub fn ushort(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn long(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes(b.try_into().expect("8-byte slice")))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.var_int()?;
        if len < 0 {
            return Err(ProxyError::MalformedPayload(format!(
                "negative string length: {len}"
            )));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProxyError::MalformedPayload(format!("invalid UTF-8: {e}")))
    }
}
