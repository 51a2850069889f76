//! Packed tuple format shared by inner hash entries, outer row stores and
//! the flat destination store.
//!
//! ```text
//!  0        4        8        12          18         20        22     23
//! ┌────────┬────────┬────────┬───────────┬──────────┬─────────┬──────┬──────────┬─────────┐
//! │ len<<2 │ typmod │ typeid │ item ptr  │ infomask2│ infomask│ hoff │ nullmap  │ values  │
//! └────────┴────────┴────────┴───────────┴──────────┴─────────┴──────┴──────────┴─────────┘
//!                                                                     ^ only with HASNULL
//! ```
//!
//! Values start at `hoff` (8-byte aligned). Fixed-length values are aligned
//! to their `attalign`; variable-length values are aligned too unless they
//! carry a short header. A clear bit in the null bitmap marks a null.

use std::ops::Range;

use crate::error::LayoutError;
use crate::layout::{
    bytes_at, checked_range, maxalign, read_i16, read_u8, read_u16, typealign, write_bytes,
    write_i16, write_i32, write_u8, write_u16, write_u32, write_u64,
};
use crate::varlena;

pub const T_DATUM_LEN: usize = 0;
pub const T_TYPMOD: usize = 4;
pub const T_TYPEID: usize = 8;
pub const T_CTID: usize = 12;
pub const T_INFOMASK2: usize = 18;
pub const T_INFOMASK: usize = 20;
pub const T_HOFF: usize = 22;
pub const T_BITS: usize = 23;
pub const SIZEOF_TUPLE_HEADER: usize = T_BITS;

pub const HEAP_NATTS_MASK: u16 = 0x07FF;
/// Largest tuple whose length fits the 30-bit length word.
pub const MAX_TUPLE_LEN: usize = (u32::MAX >> 2) as usize;
pub const HEAP_HASNULL: u16 = 0x0001;
pub const HEAP_HASOID: u16 = 0x0008;

#[inline(always)]
pub const fn bitmaplen(natts: usize) -> usize {
    natts.div_ceil(8)
}

/// Per-column attribute metadata, 8 bytes in the binary layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ColumnMeta {
    pub attnotnull: bool,
    pub attalign: u8,
    /// Positive: fixed length in bytes. Negative: variable length.
    pub attlen: i16,
}

impl ColumnMeta {
    pub const ENCODED_LEN: usize = 8;

    pub const fn fixed(attlen: i16, attalign: u8) -> Self {
        Self {
            attnotnull: false,
            attalign,
            attlen,
        }
    }

    pub const fn varlena() -> Self {
        Self {
            attnotnull: false,
            attalign: 4,
            attlen: -1,
        }
    }

    pub const fn int2() -> Self {
        Self::fixed(2, 2)
    }

    pub const fn int4() -> Self {
        Self::fixed(4, 4)
    }

    pub const fn int8() -> Self {
        Self::fixed(8, 8)
    }

    pub const fn not_null(mut self) -> Self {
        self.attnotnull = true;
        self
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        self.attlen > 0
    }

    #[inline(always)]
    pub fn align(&self) -> usize {
        self.attalign.max(1) as usize
    }

    pub fn encode_into(&self, buf: &mut [u8], offset: usize) -> Result<(), LayoutError> {
        write_u8(buf, offset, self.attnotnull as u8)?;
        write_u8(buf, offset + 1, self.attalign)?;
        write_i16(buf, offset + 2, self.attlen)?;
        write_u32(buf, offset + 4, 0)
    }

    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self, LayoutError> {
        let attalign = read_u8(bytes, offset + 1)?;
        if !matches!(attalign, 1 | 2 | 4 | 8) {
            return Err(LayoutError::malformed(
                "column metadata",
                format!("alignment {attalign}"),
            ));
        }
        Ok(Self {
            attnotnull: read_u8(bytes, offset)? != 0,
            attalign,
            attlen: read_i16(bytes, offset + 2)?,
        })
    }
}

/// Read-only view of one packed tuple.
#[derive(Copy, Clone, Debug)]
pub struct TupleRef<'a> {
    bytes: &'a [u8],
}

impl<'a> TupleRef<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, LayoutError> {
        let hoff = read_u8(bytes, T_HOFF)? as usize;
        if hoff < SIZEOF_TUPLE_HEADER || hoff > bytes.len() {
            return Err(LayoutError::malformed(
                "tuple",
                format!("header offset {hoff} in {} bytes", bytes.len()),
            ));
        }
        Ok(Self { bytes })
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline(always)]
    pub fn hoff(&self) -> usize {
        self.bytes[T_HOFF] as usize
    }

    #[inline(always)]
    pub fn natts(&self) -> usize {
        let mask = read_u16(self.bytes, T_INFOMASK2).unwrap_or(0);
        (mask & HEAP_NATTS_MASK) as usize
    }

    #[inline(always)]
    pub fn has_nulls(&self) -> bool {
        read_u16(self.bytes, T_INFOMASK).unwrap_or(0) & HEAP_HASNULL != 0
    }

    /// True when the null bitmap marks attribute `i` as null.
    #[inline(always)]
    pub fn is_null(&self, i: usize) -> bool {
        match self.bytes.get(T_BITS + (i >> 3)) {
            Some(&bits) if T_BITS + (i >> 3) < self.hoff() => bits & (1 << (i & 0x07)) == 0,
            _ => true,
        }
    }

    /// Walk the attributes described by `colmeta` in order.
    pub fn attributes<'c>(&self, colmeta: &'c [ColumnMeta]) -> Attributes<'a, 'c> {
        Attributes {
            tuple: *self,
            colmeta,
            index: 0,
            offset: self.hoff(),
            has_nulls: self.has_nulls(),
            natts: self.natts(),
        }
    }

    /// Bytes of attribute `colidx`, or `None` if it is null or missing.
    pub fn datum(
        &self,
        colmeta: &[ColumnMeta],
        colidx: usize,
    ) -> Result<Option<&'a [u8]>, LayoutError> {
        match self.attributes(colmeta).nth(colidx) {
            Some(Ok(Some(range))) => Ok(Some(&self.bytes[range])),
            Some(Ok(None)) | None => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }
}

/// Iterator over attribute byte ranges of a tuple.
pub struct Attributes<'t, 'c> {
    tuple: TupleRef<'t>,
    colmeta: &'c [ColumnMeta],
    index: usize,
    offset: usize,
    has_nulls: bool,
    natts: usize,
}

impl Attributes<'_, '_> {
    fn step(&mut self, i: usize) -> Result<Option<Range<usize>>, LayoutError> {
        if i >= self.natts || (self.has_nulls && self.tuple.is_null(i)) {
            return Ok(None);
        }
        let bytes = self.tuple.bytes;
        let cmeta = &self.colmeta[i];
        let len = if cmeta.is_fixed() {
            self.offset = typealign(cmeta.align(), self.offset);
            cmeta.attlen as usize
        } else {
            if !varlena::not_pad_byte(read_u8(bytes, self.offset)?) {
                self.offset = typealign(cmeta.align(), self.offset);
            }
            varlena::varsize_any(bytes.get(self.offset..).unwrap_or_default())?
        };
        let range = checked_range(bytes.len(), self.offset, len)?;
        self.offset = range.end;
        Ok(Some(range))
    }
}

impl Iterator for Attributes<'_, '_> {
    type Item = Result<Option<Range<usize>>, LayoutError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.colmeta.len() {
            return None;
        }
        let i = self.index;
        self.index += 1;
        let item = self.step(i);
        if item.is_err() {
            self.index = self.colmeta.len();
        }
        Some(item)
    }
}

/// Align `cur` for `datum` the way the assembler will place it.
#[inline(always)]
pub fn att_align_datum(cmeta: &ColumnMeta, cur: usize, datum: &[u8]) -> usize {
    match datum.first() {
        Some(&first) if !cmeta.is_fixed() && varlena::is_1b(first) => cur,
        _ => typealign(cmeta.align(), cur),
    }
}

#[inline(always)]
pub fn att_addlength_datum(
    cmeta: &ColumnMeta,
    cur: usize,
    datum: &[u8],
) -> Result<usize, LayoutError> {
    if cmeta.is_fixed() {
        Ok(cur + cmeta.attlen as usize)
    } else {
        Ok(cur + varlena::varsize_any(datum)?)
    }
}

/// Sizes of a tuple about to be assembled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TupleLayout {
    pub hoff: usize,
    pub data_len: usize,
    pub has_null: bool,
    pub has_oid: bool,
    /// Total bytes, header plus aligned data.
    pub required: usize,
}

pub fn tuple_layout(
    colmeta: &[ColumnMeta],
    datums: &[Option<&[u8]>],
    has_oid: bool,
) -> Result<TupleLayout, LayoutError> {
    if colmeta.len() > HEAP_NATTS_MASK as usize {
        return Err(LayoutError::malformed(
            "tuple",
            format!("{} columns", colmeta.len()),
        ));
    }
    let mut data_len = 0;
    let mut has_null = false;
    for (cmeta, datum) in colmeta.iter().zip(datums) {
        match datum {
            None => has_null = true,
            Some(datum) => {
                data_len = att_align_datum(cmeta, data_len, datum);
                data_len = att_addlength_datum(cmeta, data_len, datum)?;
            }
        }
    }
    let mut hoff = SIZEOF_TUPLE_HEADER;
    if has_null {
        hoff += bitmaplen(colmeta.len());
    }
    if has_oid {
        hoff += size_of::<u32>();
    }
    let hoff = maxalign(hoff);
    if hoff > u8::MAX as usize {
        return Err(LayoutError::malformed(
            "tuple",
            format!("header of {hoff} bytes for {} columns", colmeta.len()),
        ));
    }
    let required = hoff + maxalign(data_len);
    if required > MAX_TUPLE_LEN {
        return Err(LayoutError::malformed(
            "tuple",
            format!("{required} bytes exceed the length word"),
        ));
    }
    Ok(TupleLayout {
        hoff,
        data_len,
        has_null,
        has_oid,
        required,
    })
}

/// Assemble a tuple into `buf`, which must be exactly `layout.required`
/// bytes long.
pub fn fill_tuple(
    buf: &mut [u8],
    colmeta: &[ColumnMeta],
    datums: &[Option<&[u8]>],
    layout: &TupleLayout,
    typeid: u32,
    typmod: i32,
) -> Result<(), LayoutError> {
    if buf.len() != layout.required {
        return Err(LayoutError::malformed(
            "tuple",
            format!("buffer of {} bytes for {} required", buf.len(), layout.required),
        ));
    }
    let hoff = u8::try_from(layout.hoff)
        .map_err(|_| LayoutError::malformed("tuple", format!("t_hoff {}", layout.hoff)))?;
    let len_word = u32::try_from(layout.required)
        .ok()
        .filter(|_| layout.required <= MAX_TUPLE_LEN)
        .ok_or_else(|| LayoutError::malformed("tuple", format!("length {}", layout.required)))?;
    buf.fill(0);
    write_u32(buf, T_DATUM_LEN, len_word << 2)?;
    write_i32(buf, T_TYPMOD, typmod)?;
    write_u32(buf, T_TYPEID, typeid)?;
    write_u16(buf, T_INFOMASK2, colmeta.len() as u16 & HEAP_NATTS_MASK)?;
    let mut infomask = 0;
    if layout.has_null {
        infomask |= HEAP_HASNULL;
    }
    if layout.has_oid {
        infomask |= HEAP_HASOID;
    }
    write_u16(buf, T_INFOMASK, infomask)?;
    write_u8(buf, T_HOFF, hoff)?;

    let mut curr = layout.hoff;
    for (i, (cmeta, datum)) in colmeta.iter().zip(datums).enumerate() {
        let Some(datum) = datum else {
            continue;
        };
        curr = att_align_datum(cmeta, curr, datum);
        if cmeta.is_fixed() {
            let len = cmeta.attlen as usize;
            let src = bytes_at(datum, 0, len)?;
            match len {
                1 => write_u8(buf, curr, src[0])?,
                2 => write_u16(buf, curr, u16::from_le_bytes([src[0], src[1]]))?,
                4 => write_u32(buf, curr, u32::from_le_bytes([src[0], src[1], src[2], src[3]]))?,
                8 => {
                    let mut v = [0u8; 8];
                    v.copy_from_slice(src);
                    write_u64(buf, curr, u64::from_le_bytes(v))?
                }
                _ => write_bytes(buf, curr, src)?,
            }
            curr += len;
        } else {
            let len = varlena::varsize_any(datum)?;
            write_bytes(buf, curr, bytes_at(datum, 0, len)?)?;
            curr += len;
        }
        if layout.has_null {
            buf[T_BITS + (i >> 3)] |= 1 << (i & 0x07);
        }
    }
    Ok(())
}

/// Assemble a standalone tuple.
pub fn form_tuple(
    colmeta: &[ColumnMeta],
    datums: &[Option<&[u8]>],
) -> Result<Vec<u8>, LayoutError> {
    let layout = tuple_layout(colmeta, datums, false)?;
    let mut buf = vec![0u8; layout.required];
    fill_tuple(&mut buf, colmeta, datums, &layout, 0, -1)?;
    Ok(buf)
}
