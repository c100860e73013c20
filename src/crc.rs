//! CRC-32C (Castagnoli) checksums with the masking used for stored checksums.
//!
//! Computing the crc of a string that contains embedded crcs is problematic,
//! so every crc written to disk is masked first.

const MASK_DELTA: u32 = 0xa282ead8;

#[inline]
pub fn value(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Crc of `concat(A, data)` where `init_crc` is the crc of some string A.
#[inline]
pub fn extend(init_crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(init_crc, data)
}

#[inline]
pub fn mask(crc: u32) -> u32 {
    // rotate right by 15 bits and add a constant
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

#[inline]
pub fn unmask(masked_crc: u32) -> u32 {
    masked_crc.wrapping_sub(MASK_DELTA).rotate_left(15)
}
