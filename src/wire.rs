//! Wire serialization primitives (big-endian, no padding).
//!
//! Request and reply bodies are append-to-buffer serializations of their
//! fields in declaration order: fixed-width integers in network byte
//! order, byte strings with a u32 length prefix, value lists with a u32
//! count prefix, and bit-packed bitfields for sparse update payloads.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated buffer: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("bitfield length invalid: declared {declared} bits, {got} bytes follow")]
    BitfieldInvalid { declared: usize, got: usize },
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_byte_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

pub fn put_value_list(buf: &mut Vec<u8>, values: &[Bytes]) {
    put_u32(buf, values.len() as u32);
    for value in values {
        put_byte_string(buf, value);
    }
}

/// Sequential reader over a received body. Every accessor fails with
/// [`WireError::Truncated`] instead of reading past the end.
pub struct Unpacker {
    buf: Bytes,
    pos: usize,
}

impl Unpacker {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&[u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                needed: len - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let raw = self.take(8)?;
        Ok(u64::from_be_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]))
    }

    pub fn byte_string(&mut self) -> Result<Bytes, WireError> {
        let len = self.u32()? as usize;
        if self.remaining() < len {
            return Err(WireError::Truncated {
                needed: len - self.remaining(),
            });
        }
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    pub fn value_list(&mut self) -> Result<Vec<Bytes>, WireError> {
        let count = self.u32()? as usize;
        let mut values = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            values.push(self.byte_string()?);
        }
        Ok(values)
    }

    pub fn bitfield(&mut self) -> Result<Bitfield, WireError> {
        let bits = self.u32()? as usize;
        let len = bits.div_ceil(8);
        if self.remaining() < len {
            return Err(WireError::BitfieldInvalid {
                declared: bits,
                got: self.remaining(),
            });
        }
        let raw = self.take(len)?;
        Ok(Bitfield {
            bits,
            bytes: raw.to_vec(),
        })
    }
}

/// Fixed-width set of flags, one bit per non-key dimension of a space.
/// Serialized as a u32 bit count followed by the packed bytes; bit `i`
/// lives in byte `i / 8` at position `i % 8`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitfield {
    bits: usize,
    bytes: Vec<u8>,
}

impl Bitfield {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            bytes: vec![0u8; bits.div_ceil(8)],
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn set(&mut self, idx: usize) {
        assert!(idx < self.bits, "bit {idx} out of range {}", self.bits);
        self.bytes[idx / 8] |= 1 << (idx % 8);
    }

    pub fn is_set(&self, idx: usize) -> bool {
        idx < self.bits && self.bytes[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.bits as u32);
        buf.extend_from_slice(&self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_network_order() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 0x0102);
        put_u32(&mut buf, 0x0304_0506);
        put_u64(&mut buf, 0x0708_090a_0b0c_0d0e);
        assert_eq!(buf[0..2], [0x01, 0x02]);
        assert_eq!(buf[2..6], [0x03, 0x04, 0x05, 0x06]);

        let mut up = Unpacker::new(Bytes::from(buf));
        assert_eq!(up.u16().unwrap(), 0x0102);
        assert_eq!(up.u32().unwrap(), 0x0304_0506);
        assert_eq!(up.u64().unwrap(), 0x0708_090a_0b0c_0d0e);
        assert!(up.is_empty());
    }

    #[test]
    fn byte_strings_are_length_prefixed() {
        let mut buf = Vec::new();
        put_byte_string(&mut buf, b"key-1");
        assert_eq!(&buf[..4], &5u32.to_be_bytes());

        let mut up = Unpacker::new(Bytes::from(buf));
        assert_eq!(up.byte_string().unwrap(), Bytes::from_static(b"key-1"));
    }

    #[test]
    fn value_list_roundtrips() {
        let values = vec![
            Bytes::from_static(b"a"),
            Bytes::new(),
            Bytes::from_static(b"final"),
        ];
        let mut buf = Vec::new();
        put_value_list(&mut buf, &values);

        let mut up = Unpacker::new(Bytes::from(buf));
        assert_eq!(up.value_list().unwrap(), values);
    }

    #[test]
    fn truncated_reads_fail() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 100);
        let mut up = Unpacker::new(Bytes::from(buf));
        let err = up.byte_string().unwrap_err();
        assert_eq!(err, WireError::Truncated { needed: 100 });
    }

    #[test]
    fn bitfield_roundtrips_sparse_bits() {
        let mut bits = Bitfield::new(11);
        bits.set(0);
        bits.set(7);
        bits.set(10);
        let mut buf = Vec::new();
        bits.encode(&mut buf);

        let mut up = Unpacker::new(Bytes::from(buf));
        let decoded = up.bitfield().unwrap();
        assert_eq!(decoded, bits);
        assert!(decoded.is_set(0));
        assert!(!decoded.is_set(1));
        assert!(decoded.is_set(7));
        assert!(decoded.is_set(10));
        assert!(!decoded.is_set(64));
    }
}
