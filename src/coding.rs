//! Fixed-width and variable-length integer encoding.
//!
//! Fixed-width integers are little-endian. Varints store 7 bits per byte,
//! low group first, with the high bit set on every byte but the last.

pub const MAX_VARINT32_LEN: usize = 5;
pub const MAX_VARINT64_LEN: usize = 10;

#[inline]
pub fn put_fixed32(dst: &mut Vec<u8>, value: u32) {
    dst.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_fixed64(dst: &mut Vec<u8>, value: u64) {
    dst.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn encode_fixed32(dst: &mut [u8], value: u32) {
    dst[..4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn encode_fixed64(dst: &mut [u8], value: u64) {
    dst[..8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn decode_fixed32(src: &[u8]) -> u32 {
    debug_assert!(src.len() >= 4);
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    u32::from_le_bytes(buf)
}

#[inline]
pub fn decode_fixed64(src: &[u8]) -> u64 {
    debug_assert!(src.len() >= 8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    u64::from_le_bytes(buf)
}

pub fn put_varint32(dst: &mut Vec<u8>, value: u32) {
    put_varint64(dst, value as u64)
}

pub fn put_varint64(dst: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Number of bytes `value` takes once varint-encoded.
pub fn varint_length(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Decode a varint32 from the front of `src`.
/// Returns the value and the number of bytes consumed.
pub fn get_varint32(src: &[u8]) -> Option<(u32, usize)> {
    let mut result = 0u32;
    for (i, &byte) in src.iter().take(MAX_VARINT32_LEN).enumerate() {
        let shift = 7 * i as u32;
        if byte & 0x80 != 0 {
            result |= ((byte & 0x7f) as u32) << shift;
        } else {
            result |= (byte as u32) << shift;
            return Some((result, i + 1));
        }
    }
    None
}

pub fn get_varint64(src: &[u8]) -> Option<(u64, usize)> {
    let mut result = 0u64;
    for (i, &byte) in src.iter().take(MAX_VARINT64_LEN).enumerate() {
        let shift = 7 * i as u32;
        if byte & 0x80 != 0 {
            result |= ((byte & 0x7f) as u64) << shift;
        } else {
            result |= (byte as u64) << shift;
            return Some((result, i + 1));
        }
    }
    None
}

pub fn put_length_prefixed_slice(dst: &mut Vec<u8>, value: &[u8]) {
    put_varint32(dst, value.len() as u32);
    dst.extend_from_slice(value);
}

/// Decode a length-prefixed slice from the front of `src`.
/// Returns the slice and the total number of bytes consumed.
pub fn get_length_prefixed_slice(src: &[u8]) -> Option<(&[u8], usize)> {
    let (len, n) = get_varint32(src)?;
    let end = n + len as usize;
    if end > src.len() {
        return None;
    }
    Some((&src[n..end], end))
}

/// Cursor over an encoded buffer, used when decoding records field by field.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    pub fn varint32(&mut self) -> Option<u32> {
        let (v, n) = get_varint32(self.buf)?;
        self.buf = &self.buf[n..];
        Some(v)
    }

    pub fn varint64(&mut self) -> Option<u64> {
        let (v, n) = get_varint64(self.buf)?;
        self.buf = &self.buf[n..];
        Some(v)
    }

    pub fn fixed32(&mut self) -> Option<u32> {
        if self.buf.len() < 4 {
            return None;
        }
        let v = decode_fixed32(self.buf);
        self.buf = &self.buf[4..];
        Some(v)
    }

    pub fn fixed64(&mut self) -> Option<u64> {
        if self.buf.len() < 8 {
            return None;
        }
        let v = decode_fixed64(self.buf);
        self.buf = &self.buf[8..];
        Some(v)
    }

    pub fn byte(&mut self) -> Option<u8> {
        let (&b, rest) = self.buf.split_first()?;
        self.buf = rest;
        Some(b)
    }

    pub fn length_prefixed_slice(&mut self) -> Option<&'a [u8]> {
        let (s, n) = get_length_prefixed_slice(self.buf)?;
        self.buf = &self.buf[n..];
        Some(s)
    }
}
