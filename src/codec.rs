//! Bounds-checked little-endian packing for the on-disk layouts.
//!
//! All multi-byte integers in metadata structures are little-endian. The
//! decoder never pre-allocates from an untrusted count: corrupted records
//! produce `RemapError::Decode`, not a pathological allocation.

use crate::error::RemapError;

type DecodeResult<T> = Result<T, RemapError>;

const ERR_EOF: RemapError = RemapError::Decode("unexpected end of record");

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Raw bytes, no length prefix. Fixed-width fields only.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Length-prefixed (u16) byte string. Used for paths, serials, models.
    pub fn str16(&mut self, s: &str) -> &mut Self {
        let bytes = s.as_bytes();
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.u16(bytes.len() as u16);
        self.raw(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Raw view of an already-consumed region, for checksumming a decoded
    /// span against its trailing CRC field.
    pub fn window(&self, start: usize, end: usize) -> &'a [u8] {
        &self.buf[start..end]
    }

    fn take(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ERR_EOF);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> DecodeResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> DecodeResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> DecodeResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn raw(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        self.take(n)
    }

    pub fn array16(&mut self) -> DecodeResult<[u8; 16]> {
        let b = self.take(16)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(b);
        Ok(out)
    }

    pub fn str16(&mut self) -> DecodeResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RemapError::Decode("string field is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars() {
        let mut e = Encoder::new();
        e.u8(0xAB).u16(0x1234).u32(0xDEAD_BEEF).u64(0x0102_0304_0506_0708);
        e.str16("sda");
        let bytes = e.finish();

        let mut d = Decoder::new(&bytes);
        assert_eq!(d.u8().unwrap(), 0xAB);
        assert_eq!(d.u16().unwrap(), 0x1234);
        assert_eq!(d.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(d.u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(d.str16().unwrap(), "sda");
        assert_eq!(d.remaining(), 0);
    }

    #[test]
    fn integers_are_little_endian() {
        let mut e = Encoder::new();
        e.u32(0x1122_3344);
        assert_eq!(e.finish(), vec![0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        let mut d = Decoder::new(&[0x01, 0x02]);
        assert!(matches!(d.u32(), Err(RemapError::Decode(_))));
    }

    #[test]
    fn oversized_string_length_does_not_panic() {
        // A length prefix larger than the remaining buffer must fail cleanly.
        let mut e = Encoder::new();
        e.u16(u16::MAX);
        let bytes = e.finish();
        let mut d = Decoder::new(&bytes);
        assert!(d.str16().is_err());
    }
}
