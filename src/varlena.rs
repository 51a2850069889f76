//! Variable-length datum headers.
//!
//! ```text
//!   short (1B):     [ len << 1 | 1 ]  payload...          len <= 127, unaligned
//!   plain (4B_U):   [ len << 2      ]  payload...          4-byte aligned
//!   compressed:     [ len << 2 | 2  ]  rawsize, data...    host only
//!   external (1B_E):[ 0x01 ][ tag ]    pointer...          host only
//! ```
//!
//! `len` always includes the header. Aligned values are preceded by zero
//! padding, and no header starts with a zero byte except a plain one sitting
//! on its natural alignment, which lets a decoder tell padding apart from a
//! short header.

use crate::error::LayoutError;
use crate::layout::{read_u8, read_u32};

pub const VARHDRSZ: usize = 4;
pub const VARHDRSZ_SHORT: usize = 1;
pub const VARHDRSZ_EXTERNAL: usize = 2;
pub const VARATT_SHORT_MAX: usize = 0x7F;
/// Tag of an on-disk external pointer.
pub const VARTAG_ONDISK: u8 = 18;
const VARTAG_ONDISK_SIZE: usize = 16;

#[inline(always)]
pub fn is_1b(first: u8) -> bool {
    first & 0x01 == 0x01
}

#[inline(always)]
pub fn is_1b_e(first: u8) -> bool {
    first == 0x01
}

#[inline(always)]
pub fn is_4b_u(first: u8) -> bool {
    first & 0x03 == 0x00
}

#[inline(always)]
pub fn is_4b_c(first: u8) -> bool {
    first & 0x03 == 0x02
}

#[inline(always)]
pub fn not_pad_byte(first: u8) -> bool {
    first != 0
}

/// Total size of the datum at the start of `datum`, header included.
pub fn varsize_any(datum: &[u8]) -> Result<usize, LayoutError> {
    let first = read_u8(datum, 0)?;
    if is_1b_e(first) {
        match read_u8(datum, 1)? {
            VARTAG_ONDISK => Ok(VARHDRSZ_EXTERNAL + VARTAG_ONDISK_SIZE),
            tag => Err(LayoutError::malformed("varlena", format!("unknown external tag {tag}"))),
        }
    } else if is_1b(first) {
        Ok(((first >> 1) & 0x7F) as usize)
    } else {
        Ok(((read_u32(datum, 0)? >> 2) & 0x3FFF_FFFF) as usize)
    }
}

/// Payload bytes of an uncompressed, inline datum.
pub fn vardata_any(datum: &[u8]) -> Result<&[u8], LayoutError> {
    let first = read_u8(datum, 0)?;
    let size = varsize_any(datum)?;
    let hdr = if is_1b(first) { VARHDRSZ_SHORT } else { VARHDRSZ };
    if size < hdr || size > datum.len() {
        return Err(LayoutError::malformed(
            "varlena",
            format!("size {size} with {} bytes available", datum.len()),
        ));
    }
    Ok(&datum[hdr..size])
}

/// Compressed and external values must be expanded by the host first.
#[inline(always)]
pub fn is_device_readable(first: u8) -> bool {
    is_4b_u(first) || (is_1b(first) && !is_1b_e(first))
}

/// Encode `payload` with the shortest header that fits.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let short = payload.len() + VARHDRSZ_SHORT;
    if short <= VARATT_SHORT_MAX {
        let mut out = Vec::with_capacity(short);
        out.push(((short as u8) << 1) | 0x01);
        out.extend_from_slice(payload);
        out
    } else {
        encode_long(payload)
    }
}

/// Encode `payload` with a 4-byte header regardless of its size.
pub fn encode_long(payload: &[u8]) -> Vec<u8> {
    let size = payload.len() + VARHDRSZ;
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&((size as u32) << 2).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Inline compressed datum; the device can size it but not read it.
pub fn encode_compressed(raw_size: u32, data: &[u8]) -> Vec<u8> {
    let size = VARHDRSZ + 4 + data.len();
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(((size as u32) << 2) | 0x02).to_le_bytes());
    out.extend_from_slice(&raw_size.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Pointer to a value stored out of line.
pub fn encode_external(pointer: [u8; VARTAG_ONDISK_SIZE]) -> Vec<u8> {
    let mut out = vec![0x01, VARTAG_ONDISK];
    out.extend_from_slice(&pointer);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header() {
        let v = encode(b"abc");
        assert_eq!(v.len(), 4);
        assert!(is_1b(v[0]));
        assert!(!is_1b_e(v[0]));
        assert_eq!(varsize_any(&v), Ok(4));
        assert_eq!(vardata_any(&v), Ok(&b"abc"[..]));
        assert!(is_device_readable(v[0]));
    }

    #[test]
    fn empty_short_is_not_padding() {
        let v = encode(b"");
        assert_eq!(v, vec![0x03]);
        assert!(not_pad_byte(v[0]));
    }

    #[test]
    fn long_header() {
        let payload = vec![7u8; 300];
        let v = encode(&payload);
        assert_eq!(v.len(), 304);
        assert!(is_4b_u(v[0]));
        assert_eq!(varsize_any(&v), Ok(304));
        assert_eq!(vardata_any(&v).unwrap(), &payload[..]);
    }

    #[test]
    fn boundary_between_short_and_long() {
        assert_eq!(encode(&[0u8; 126]).len(), 127);
        assert_eq!(encode(&[0u8; 127]).len(), 131);
    }

    #[test]
    fn compressed_and_external_need_the_host() {
        let c = encode_compressed(1000, &[1, 2, 3]);
        assert!(is_4b_c(c[0]));
        assert_eq!(varsize_any(&c), Ok(11));
        assert!(!is_device_readable(c[0]));

        let e = encode_external([9; 16]);
        assert!(is_1b_e(e[0]));
        assert_eq!(varsize_any(&e), Ok(18));
        assert!(!is_device_readable(e[0]));
    }

    #[test]
    fn truncated_datum() {
        let v = encode(b"hello");
        assert!(vardata_any(&v[..3]).is_err());
        assert!(varsize_any(&[]).is_err());
        assert!(varsize_any(&[0x01, 3]).is_err());
    }
}
