#![forbid(unsafe_code)]
//! Encoding, varint, and slice-reading utilities shared across storage layers.

pub mod ord {
    //! Order-preserving encoders for numeric keys.
    //!
    //! Keys are compared as raw bytes, so integers are stored big-endian and
    //! signed values get their sign bit flipped.

    use crate::types::{BlinkError, Result};

    const U64_LEN: usize = core::mem::size_of::<u64>();
    const SIGN_BIT: u64 = 1 << 63;

    /// Big-endian encoding for lexicographic order preservation.
    pub fn encode_u64(v: u64) -> [u8; U64_LEN] {
        v.to_be_bytes()
    }

    /// Decodes a big-endian u64 key.
    pub fn decode_u64(src: &[u8]) -> Result<u64> {
        let bytes: [u8; U64_LEN] = src
            .try_into()
            .map_err(|_| BlinkError::Corruption("u64 key must be 8 bytes"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Encodes a signed i64 with order preservation (flip sign bit for sorting).
    pub fn encode_i64(v: i64) -> [u8; U64_LEN] {
        encode_u64((v as u64) ^ SIGN_BIT)
    }

    /// Decodes a signed i64 produced by [`encode_i64`].
    pub fn decode_i64(src: &[u8]) -> Result<i64> {
        Ok((decode_u64(src)? ^ SIGN_BIT) as i64)
    }
}

pub mod var {
    //! Unsigned varints and length-prefixed byte strings.

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Appends `bytes` prefixed by its varint length.
    pub fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
        encode_u64(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }

    /// Appends an optional byte string: a presence byte, then the bytes.
    pub fn encode_opt_bytes(bytes: Option<&[u8]>, out: &mut Vec<u8>) {
        match bytes {
            Some(bytes) => {
                out.push(1);
                encode_bytes(bytes, out);
            }
            None => out.push(0),
        }
    }
}

use crate::types::{BlinkError, Result};

/// Fallible reader over a byte slice; every short read is reported as corruption.
#[derive(Clone, Copy, Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(BlinkError::Corruption("record truncated"))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Reads an unsigned varint.
    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for _ in 0..10 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64) << shift;
            if (byte & 0x80) == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(BlinkError::Corruption("varint too long"))
    }

    /// Takes `len` bytes without copying.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(BlinkError::Corruption("length overflow"))?;
        if end > self.buf.len() {
            return Err(BlinkError::Corruption("record truncated"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads a varint-length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_var_u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a byte string written by [`var::encode_opt_bytes`].
    pub fn read_opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => self.read_bytes().map(Some),
            _ => Err(BlinkError::Corruption("invalid option tag")),
        }
    }

    /// Fails unless every byte was consumed.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(BlinkError::Corruption("trailing bytes after record"))
        }
    }
}
