//! Row stores: the outer relation fed to the execution kernel and the
//! destination filled by a projection kernel.
//!
//! Three physical formats exist:
//!
//! * `Row`: tuples live in host pages (blocks); a row-item table maps a row
//!   index to `(block, offset)`.
//! * `RowFlat`: one arena of `length` bytes. The front is reserved for the
//!   store header and the row-item table, tuples are packed back-to-front
//!   from the end and `usage` counts the bytes they take.
//! * `TupSlot`: `ncols` values and null flags per row at a fixed stride.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{JoinError, LayoutError, Result};
use crate::layout::{SharedSlice, bytes_at, maxalign, read_u32, stromalign};
use crate::tuple::{ColumnMeta, T_DATUM_LEN, TupleRef};

/// Fixed part of the store header in front of the column metadata.
pub const KDS_HEADER_LEN: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreFormat {
    Row,
    RowFlat,
    TupSlot,
}

impl StoreFormat {
    #[inline(always)]
    pub fn is_row(self) -> bool {
        matches!(self, Self::Row | Self::RowFlat)
    }
}

#[derive(Clone, Debug)]
struct RowBlock {
    /// Host address of the page.
    page: u64,
    data: Vec<u8>,
}

#[derive(Copy, Clone, Debug)]
struct RowItem {
    block: u32,
    offset: u32,
}

#[derive(Debug)]
enum StoreBody {
    Row {
        blocks: Vec<RowBlock>,
        rowitems: Vec<RowItem>,
    },
    Flat {
        arena: Vec<u8>,
        rowitems: Vec<u32>,
    },
    Slot {
        values: Vec<u64>,
        isnull: Vec<bool>,
    },
}

/// A tuple fetched from a row store together with the host address it
/// occupies there.
#[derive(Copy, Clone, Debug)]
pub struct SourceTuple<'a> {
    pub tuple: TupleRef<'a>,
    pub hostaddr: u64,
}

/// Length recorded in the tuple's own header word.
fn tuple_at(bytes: &[u8], offset: usize) -> Result<TupleRef<'_>, LayoutError> {
    let len = (read_u32(bytes, offset + T_DATUM_LEN)? >> 2) as usize;
    TupleRef::new(bytes_at(bytes, offset, len)?)
}

#[derive(Debug)]
pub struct DataStore {
    format: StoreFormat,
    colmeta: Vec<ColumnMeta>,
    hostptr: u64,
    has_oid: bool,
    typeid: u32,
    typmod: i32,
    nrooms: u32,
    length: u32,
    nitems: AtomicU32,
    usage: AtomicU32,
    body: StoreBody,
}

/// Mutable pieces of a flat store shared by one projection launch.
pub struct FlatParts<'a> {
    pub colmeta: &'a [ColumnMeta],
    pub has_oid: bool,
    pub typeid: u32,
    pub typmod: i32,
    pub nrooms: u32,
    pub length: u32,
    pub nitems: &'a AtomicU32,
    pub usage: &'a AtomicU32,
    pub arena: SharedSlice<'a, u8>,
    pub rowitems: SharedSlice<'a, u32>,
}

/// Mutable pieces of a tuple-slot store shared by one projection launch.
pub struct SlotParts<'a> {
    pub ncols: usize,
    pub nrooms: u32,
    pub nitems: &'a AtomicU32,
    pub values: SharedSlice<'a, u64>,
    pub isnull: SharedSlice<'a, bool>,
}

impl DataStore {
    fn with_body(
        format: StoreFormat,
        colmeta: Vec<ColumnMeta>,
        hostptr: u64,
        nrooms: u32,
        length: u32,
        body: StoreBody,
    ) -> Self {
        Self {
            format,
            colmeta,
            hostptr,
            has_oid: false,
            typeid: 0,
            typmod: -1,
            nrooms,
            length,
            nitems: AtomicU32::new(0),
            usage: AtomicU32::new(0),
            body,
        }
    }

    /// Empty block-based store; fill it with [`append_block`](Self::append_block).
    pub fn row_blocks(colmeta: Vec<ColumnMeta>, hostptr: u64) -> Self {
        Self::with_body(
            StoreFormat::Row,
            colmeta,
            hostptr,
            0,
            0,
            StoreBody::Row {
                blocks: Vec::new(),
                rowitems: Vec::new(),
            },
        )
    }

    /// Flat store of `length` bytes with room for `nrooms` rows.
    pub fn row_flat(colmeta: Vec<ColumnMeta>, nrooms: u32, length: u32, hostptr: u64) -> Self {
        Self::with_body(
            StoreFormat::RowFlat,
            colmeta,
            hostptr,
            nrooms,
            length,
            StoreBody::Flat {
                arena: vec![0; length as usize],
                rowitems: vec![0; nrooms as usize],
            },
        )
    }

    pub fn tuple_slot(colmeta: Vec<ColumnMeta>, nrooms: u32, hostptr: u64) -> Self {
        let cells = colmeta.len() * nrooms as usize;
        let length = (cells * (size_of::<u64>() + size_of::<bool>())) as u32;
        Self::with_body(
            StoreFormat::TupSlot,
            colmeta,
            hostptr,
            nrooms,
            length,
            StoreBody::Slot {
                values: vec![0; cells],
                isnull: vec![true; cells],
            },
        )
    }

    /// Reserve space for an object id in assembled tuples.
    pub fn with_oid(mut self) -> Self {
        self.has_oid = true;
        self
    }

    /// Row type stamped on assembled tuples.
    pub fn with_type(mut self, typeid: u32, typmod: i32) -> Self {
        self.typeid = typeid;
        self.typmod = typmod;
        self
    }

    /// Bytes in front of the tuples of a flat store holding `nrows` rows.
    pub fn flat_head_len(ncols: usize, nrows: usize) -> usize {
        stromalign(KDS_HEADER_LEN + ColumnMeta::ENCODED_LEN * ncols)
            + stromalign(size_of::<u32>() * nrows)
    }

    #[inline(always)]
    pub fn format(&self) -> StoreFormat {
        self.format
    }

    #[inline(always)]
    pub fn ncols(&self) -> usize {
        self.colmeta.len()
    }

    #[inline(always)]
    pub fn colmeta(&self) -> &[ColumnMeta] {
        &self.colmeta
    }

    #[inline(always)]
    pub fn hostptr(&self) -> u64 {
        self.hostptr
    }

    #[inline(always)]
    pub fn has_oid(&self) -> bool {
        self.has_oid
    }

    #[inline(always)]
    pub fn nitems(&self) -> u32 {
        self.nitems.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn nrooms(&self) -> u32 {
        self.nrooms
    }

    #[inline(always)]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[inline(always)]
    pub fn usage(&self) -> u32 {
        self.usage.load(Ordering::Acquire)
    }

    /// Append one host page of tuples to a block-based store.
    pub fn append_block(&mut self, page: u64, tuples: &[Vec<u8>]) -> Result<()> {
        let StoreBody::Row { blocks, rowitems } = &mut self.body else {
            return Err(JoinError::Corruption(format!(
                "append_block on a {:?} store",
                self.format
            )));
        };
        let block = blocks.len() as u32;
        let mut data = Vec::new();
        for t in tuples {
            TupleRef::new(t)?;
            let offset = data.len();
            data.extend_from_slice(t);
            data.resize(maxalign(data.len()), 0);
            rowitems.push(RowItem {
                block,
                offset: offset as u32,
            });
        }
        blocks.push(RowBlock { page, data });
        self.length += blocks[block as usize].data.len() as u32;
        self.nrooms = rowitems.len() as u32;
        self.nitems.store(self.nrooms, Ordering::Release);
        Ok(())
    }

    /// Pack one tuple into a flat store from the host side.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> Result<()> {
        TupleRef::new(tuple)?;
        let ncols = self.colmeta.len();
        let nitems = self.nitems.load(Ordering::Relaxed);
        let StoreBody::Flat { arena, rowitems } = &mut self.body else {
            return Err(JoinError::Corruption(format!(
                "insert_tuple on a {:?} store",
                self.format
            )));
        };
        if nitems >= self.nrooms {
            return Err(JoinError::NoSpace {
                required: nitems as u64 + 1,
                capacity: self.nrooms as u64,
            });
        }
        let usage = self.usage.load(Ordering::Relaxed) as usize + maxalign(tuple.len());
        let head = Self::flat_head_len(ncols, nitems as usize + 1);
        if head + usage > self.length as usize {
            return Err(JoinError::NoSpace {
                required: (head + usage) as u64,
                capacity: self.length as u64,
            });
        }
        let offset = self.length as usize - usage;
        arena[offset..offset + tuple.len()].copy_from_slice(tuple);
        rowitems[nitems as usize] = offset as u32;
        self.usage.store(usage as u32, Ordering::Relaxed);
        self.nitems.store(nitems + 1, Ordering::Release);
        Ok(())
    }

    /// Fetch row `row` of a row-oriented store.
    pub fn get_tuple(&self, row: usize) -> Result<SourceTuple<'_>, LayoutError> {
        let out_of_range = || LayoutError::OutOfBounds {
            offset: row,
            len: 1,
            size: self.nitems() as usize,
        };
        match &self.body {
            StoreBody::Row { blocks, rowitems } => {
                let item = rowitems.get(row).ok_or_else(out_of_range)?;
                let block = blocks.get(item.block as usize).ok_or_else(|| {
                    LayoutError::malformed("row item", format!("block {} missing", item.block))
                })?;
                Ok(SourceTuple {
                    tuple: tuple_at(&block.data, item.offset as usize)?,
                    hostaddr: block.page + item.offset as u64,
                })
            }
            StoreBody::Flat { arena, rowitems } => {
                if row >= self.nitems() as usize {
                    return Err(out_of_range());
                }
                let offset = *rowitems.get(row).ok_or_else(out_of_range)? as usize;
                Ok(SourceTuple {
                    tuple: tuple_at(arena, offset)?,
                    hostaddr: self.hostptr + offset as u64,
                })
            }
            StoreBody::Slot { .. } => Err(LayoutError::malformed(
                "data store",
                "tuple-slot store has no tuples",
            )),
        }
    }

    /// Row `row` of a flat store, as the host reads it back after projection.
    pub fn flat_tuple(&self, row: usize) -> Result<TupleRef<'_>, LayoutError> {
        if self.format != StoreFormat::RowFlat {
            return Err(LayoutError::malformed("data store", "not a flat row store"));
        }
        Ok(self.get_tuple(row)?.tuple)
    }

    /// Values and null flags of one row of a tuple-slot store.
    pub fn slot_row(&self, row: usize) -> Result<(&[u64], &[bool]), LayoutError> {
        let StoreBody::Slot { values, isnull } = &self.body else {
            return Err(LayoutError::malformed("data store", "not a tuple-slot store"));
        };
        let ncols = self.colmeta.len();
        let range = crate::layout::checked_range(values.len(), row * ncols, ncols)?;
        Ok((&values[range.clone()], &isnull[range]))
    }

    pub fn flat_parts(&mut self) -> Result<FlatParts<'_>, LayoutError> {
        let DataStore {
            colmeta,
            has_oid,
            typeid,
            typmod,
            nrooms,
            length,
            nitems,
            usage,
            body,
            ..
        } = self;
        let StoreBody::Flat { arena, rowitems } = body else {
            return Err(LayoutError::malformed("data store", "not a flat row store"));
        };
        Ok(FlatParts {
            colmeta,
            has_oid: *has_oid,
            typeid: *typeid,
            typmod: *typmod,
            nrooms: *nrooms,
            length: *length,
            nitems,
            usage,
            arena: SharedSlice::new(arena),
            rowitems: SharedSlice::new(rowitems),
        })
    }

    pub fn slot_parts(&mut self) -> Result<SlotParts<'_>, LayoutError> {
        let DataStore {
            colmeta,
            nrooms,
            nitems,
            body,
            ..
        } = self;
        let StoreBody::Slot { values, isnull } = body else {
            return Err(LayoutError::malformed("data store", "not a tuple-slot store"));
        };
        Ok(SlotParts {
            ncols: colmeta.len(),
            nrooms: *nrooms,
            nitems,
            values: SharedSlice::new(values),
            isnull: SharedSlice::new(isnull),
        })
    }
}
