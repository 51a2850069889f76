//! Join-key hashing.
//!
//! Keys are hashed with a table-driven CRC32 (MSB first, polynomial
//! 0x04C11DB7). Fixed-length values feed their bytes least significant
//! first; variable-length values feed their payload without the header.
//! Null keys leave the hash untouched. The host packer and every probe use
//! the same [`HashKey`], so bucket `hash % nslots` agrees on both sides.

use crate::error::LayoutError;
use crate::tuple::ColumnMeta;
use crate::varlena;

const CRC32_POLY: u32 = 0x04C1_1DB7;

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 0x8000_0000 != 0 {
                (c << 1) ^ CRC32_POLY
            } else {
                c << 1
            };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_crc32_table();

pub fn crc32_table() -> &'static [u32; 256] {
    &CRC32_TABLE
}

/// A key column as seen by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyDatum<'a> {
    Null,
    /// Comparable bytes: the raw value, or the payload of a varlena.
    Value(&'a [u8]),
    /// Compressed or external; only the host can compare it.
    NeedsHost,
}

impl<'a> KeyDatum<'a> {
    /// Interpret the attribute bytes `datum` of a column described by `cmeta`.
    pub fn read(cmeta: &ColumnMeta, datum: Option<&'a [u8]>) -> Result<Self, LayoutError> {
        let Some(datum) = datum else {
            return Ok(Self::Null);
        };
        if cmeta.is_fixed() {
            return Ok(Self::Value(datum));
        }
        let first = datum.first().copied().ok_or_else(|| {
            LayoutError::malformed("varlena", "empty datum")
        })?;
        if varlena::is_device_readable(first) {
            Ok(Self::Value(varlena::vardata_any(datum)?))
        } else {
            Ok(Self::NeedsHost)
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HashKey(u32);

impl Default for HashKey {
    fn default() -> Self {
        Self::new()
    }
}

impl HashKey {
    #[inline(always)]
    pub fn new() -> Self {
        Self(0xFFFF_FFFF)
    }

    #[inline(always)]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        let mut hash = self.0;
        for &b in bytes {
            let index = ((hash >> 24) ^ b as u32) & 0xFF;
            hash = CRC32_TABLE[index as usize] ^ (hash << 8);
        }
        self.0 = hash;
    }

    /// Feed a fixed-length little-endian value.
    #[inline(always)]
    pub fn update_fixed(&mut self, value: &[u8]) {
        self.update_bytes(value);
    }

    /// Feed a whole varlena datum; only its payload is hashed.
    pub fn update_varlena(&mut self, datum: &[u8]) -> Result<(), LayoutError> {
        self.update_bytes(varlena::vardata_any(datum)?);
        Ok(())
    }

    #[inline(always)]
    pub fn update(&mut self, key: KeyDatum<'_>) {
        if let KeyDatum::Value(bytes) = key {
            self.update_bytes(bytes);
        }
    }

    #[inline(always)]
    pub fn finish(self) -> u32 {
        self.0 ^ 0xFFFF_FFFF
    }

    /// Hash a complete key.
    pub fn of(keys: &[KeyDatum<'_>]) -> u32 {
        let mut h = Self::new();
        for &k in keys {
            h.update(k);
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_polynomial() {
        let t = crc32_table();
        assert_eq!(t[0], 0);
        assert_eq!(t[1], CRC32_POLY);
        assert_eq!(t[255], 0xB1F7_40B4);
    }

    #[test]
    fn check_value() {
        let mut h = HashKey::new();
        h.update_bytes(b"123456789");
        assert_eq!(h.0, 0x0376_E6E7);
        assert_eq!(h.finish(), 0xFC89_1918);
    }

    #[test]
    fn nulls_do_not_change_the_hash() {
        let a = HashKey::of(&[KeyDatum::Value(b"x"), KeyDatum::Null]);
        let b = HashKey::of(&[KeyDatum::Value(b"x")]);
        assert_eq!(a, b);
    }

    #[test]
    fn varlena_hash_ignores_header_width() {
        let short = varlena::encode(b"key");
        let long = varlena::encode_long(b"key");
        let mut a = HashKey::new();
        a.update_varlena(&short).unwrap();
        let mut b = HashKey::new();
        b.update_varlena(&long).unwrap();
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn key_datum_reading() {
        let text = ColumnMeta::varlena();
        let v = varlena::encode(b"abc");
        assert_eq!(KeyDatum::read(&text, Some(&v)), Ok(KeyDatum::Value(b"abc")));
        let c = varlena::encode_compressed(64, b"zz");
        assert_eq!(KeyDatum::read(&text, Some(&c)), Ok(KeyDatum::NeedsHost));
        assert_eq!(KeyDatum::read(&text, None), Ok(KeyDatum::Null));
        let int = ColumnMeta::int4();
        let n = 5i32.to_le_bytes();
        assert_eq!(KeyDatum::read(&int, Some(&n)), Ok(KeyDatum::Value(&n[..])));
    }

    #[test]
    fn fixed_values_spread() {
        let mut seen = std::collections::HashSet::new();
        for key in 0..10_000u32 {
            seen.insert(HashKey::of(&[KeyDatum::Value(&key.to_le_bytes())]));
        }
        assert_eq!(seen.len(), 10_000);
    }
}
