//! Chained hash tables of the inner relations, packed into one relocatable
//! region.
//!
//! # Layout
//!
//! ```text
//!  MultiHashTable                        HashTable (one per depth 1..=M)
//! ┌───────────────────────────┐         ┌──────────────────────────┐
//! │ hostptr         (u64)     │         │ ncols  nslots  is_outer  │
//! │ length          (u32)     │         ├──────────────────────────┤
//! │ ntables = M     (u32)     │         │ colmeta[ncols]           │
//! │ htable_offset[0] = 0      │         ├──────────────────────────┤
//! │ htable_offset[1] ─────────┼───┐     │ slot[0..N]  (u32) ───────┼──┐
//! │ ...                       │   │     ├──────────────────────────┤  │
//! │ htable_offset[M]          │   │     │ HashEntry                │<─┘
//! ├───────────────────────────┤   │     │  next hash rowid t_len   │──┐
//! │ HashTable(1)              │<──┘     │  tuple...                │  │
//! │ HashTable(2) ...          │         │ HashEntry ...            │<─┘
//! └───────────────────────────┘         └──────────────────────────┘
//! ```
//!
//! Table offsets are relative to the region; slot and `next` offsets are
//! relative to their own table. Offset 0 never names a table or an entry,
//! so it doubles as the end-of-chain and empty-slot marker. Every offset is a
//! multiple of [`STROMALIGN_LEN`].

use crate::error::LayoutError;
use crate::hashkey::{HashKey, KeyDatum};
use crate::layout::{
    STROMALIGN_LEN, bytes_at, checked_range, read_u8, read_u32, read_u64, stromalign, write_bytes,
    write_u8, write_u32, write_u64,
};
use crate::tuple::{ColumnMeta, TupleRef, form_tuple};

const MH_HOSTPTR: usize = 0;
const MH_LENGTH: usize = 8;
const MH_NTABLES: usize = 12;
const MH_OFFSETS: usize = 16;

const HT_NCOLS: usize = 0;
const HT_NSLOTS: usize = 4;
const HT_IS_OUTER: usize = 8;
const HT_COLMETA: usize = 16;

const HE_NEXT: usize = 0;
const HE_HASH: usize = 4;
const HE_ROWID: usize = 8;
const HE_TLEN: usize = 12;
pub const HE_TUPLE: usize = 16;

#[inline(always)]
fn multihash_header_len(ntables: usize) -> usize {
    stromalign(MH_OFFSETS + size_of::<u32>() * (ntables + 1))
}

#[inline(always)]
fn slot_array_offset(ncols: usize) -> usize {
    stromalign(HT_COLMETA + ColumnMeta::ENCODED_LEN * ncols)
}

#[inline(always)]
fn entries_offset(ncols: usize, nslots: usize) -> usize {
    stromalign(slot_array_offset(ncols) + size_of::<u32>() * nslots)
}

#[inline(always)]
pub fn hash_entry_size(t_len: usize) -> usize {
    stromalign(HE_TUPLE + t_len)
}

#[inline(always)]
fn check_aligned(offset: usize) -> Result<(), LayoutError> {
    if offset % STROMALIGN_LEN != 0 {
        return Err(LayoutError::Misaligned {
            offset,
            align: STROMALIGN_LEN,
        });
    }
    Ok(())
}

/// Read-only view of a packed multi-hash region.
#[derive(Copy, Clone, Debug)]
pub struct MultiHashView<'a> {
    bytes: &'a [u8],
    ntables: usize,
}

impl<'a> MultiHashView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, LayoutError> {
        let length = read_u32(bytes, MH_LENGTH)? as usize;
        let bytes = bytes_at(bytes, 0, length)?;
        let ntables = read_u32(bytes, MH_NTABLES)? as usize;
        checked_range(length, 0, multihash_header_len(ntables))?;
        Ok(Self { bytes, ntables })
    }

    #[inline(always)]
    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn ntables(&self) -> usize {
        self.ntables
    }

    #[inline(always)]
    pub fn hostptr(&self) -> u64 {
        read_u64(self.bytes, MH_HOSTPTR).unwrap_or(0)
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Byte offset of the table at `depth` within the region.
    pub fn table_offset(&self, depth: usize) -> Result<usize, LayoutError> {
        if depth == 0 || depth > self.ntables {
            return Err(LayoutError::InvalidDepth {
                depth,
                ntables: self.ntables,
            });
        }
        let offset = read_u32(self.bytes, MH_OFFSETS + size_of::<u32>() * depth)? as usize;
        if offset < multihash_header_len(self.ntables) {
            return Err(LayoutError::malformed(
                "multihash",
                format!("table {depth} at offset {offset} overlaps the header"),
            ));
        }
        check_aligned(offset)?;
        checked_range(self.bytes.len(), offset, HT_COLMETA)?;
        Ok(offset)
    }

    /// Locate the inner table at `depth` (1-based).
    pub fn table(&self, depth: usize) -> Result<HashTableView<'a>, LayoutError> {
        let offset = self.table_offset(depth)?;
        HashTableView::new(&self.bytes[offset..], offset)
    }

    /// All inner tables, index `d - 1` holding depth `d`.
    pub fn tables(&self) -> Result<Vec<HashTableView<'a>>, LayoutError> {
        (1..=self.ntables).map(|d| self.table(d)).collect()
    }
}

/// One inner table. `bytes` starts at the table base and runs to the end of
/// the region.
#[derive(Clone, Debug)]
pub struct HashTableView<'a> {
    bytes: &'a [u8],
    base: usize,
    nslots: usize,
    is_outer: bool,
    colmeta: Vec<ColumnMeta>,
    entries_start: usize,
}

impl<'a> HashTableView<'a> {
    fn new(bytes: &'a [u8], base: usize) -> Result<Self, LayoutError> {
        let ncols = read_u32(bytes, HT_NCOLS)? as usize;
        let nslots = read_u32(bytes, HT_NSLOTS)? as usize;
        if nslots == 0 {
            return Err(LayoutError::malformed("hash table", "zero slots"));
        }
        let is_outer = read_u8(bytes, HT_IS_OUTER)? != 0;
        let entries_start = entries_offset(ncols, nslots);
        checked_range(bytes.len(), 0, entries_start)?;
        let colmeta = (0..ncols)
            .map(|i| ColumnMeta::decode(bytes, HT_COLMETA + ColumnMeta::ENCODED_LEN * i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            bytes,
            base,
            nslots,
            is_outer,
            colmeta,
            entries_start,
        })
    }

    #[inline(always)]
    pub fn ncols(&self) -> usize {
        self.colmeta.len()
    }

    #[inline(always)]
    pub fn nslots(&self) -> usize {
        self.nslots
    }

    #[inline(always)]
    pub fn is_outer(&self) -> bool {
        self.is_outer
    }

    #[inline(always)]
    pub fn colmeta(&self) -> &[ColumnMeta] {
        &self.colmeta
    }

    /// Offset of this table within the multi-hash region.
    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    pub fn slot_index(&self, hash: u32) -> usize {
        hash as usize % self.nslots
    }

    #[inline(always)]
    pub fn slot(&self, index: usize) -> Result<u32, LayoutError> {
        if index >= self.nslots {
            return Err(LayoutError::OutOfBounds {
                offset: index,
                len: 1,
                size: self.nslots,
            });
        }
        read_u32(self.bytes, slot_array_offset(self.ncols()) + size_of::<u32>() * index)
    }

    /// Decode the entry at `offset` (relative to the table base).
    pub fn entry_at(&self, offset: u32) -> Result<HashEntryView<'a>, LayoutError> {
        let off = offset as usize;
        if off < self.entries_start {
            return Err(LayoutError::malformed(
                "hash entry",
                format!("offset {off} precedes the entry region at {}", self.entries_start),
            ));
        }
        check_aligned(off)?;
        let t_len = read_u32(self.bytes, off + HE_TLEN)? as usize;
        let tuple = bytes_at(self.bytes, off + HE_TUPLE, t_len)?;
        Ok(HashEntryView {
            offset,
            next: read_u32(self.bytes, off + HE_NEXT)?,
            hash: read_u32(self.bytes, off + HE_HASH)?,
            rowid: read_u32(self.bytes, off + HE_ROWID)?,
            tuple,
        })
    }

    pub fn first_entry(&self, hash: u32) -> Result<Option<HashEntryView<'a>>, LayoutError> {
        match self.slot(self.slot_index(hash))? {
            0 => Ok(None),
            off => self.entry_at(off).map(Some),
        }
    }

    pub fn next_entry(
        &self,
        entry: &HashEntryView<'a>,
    ) -> Result<Option<HashEntryView<'a>>, LayoutError> {
        match entry.next {
            0 => Ok(None),
            off => self.entry_at(off).map(Some),
        }
    }

    /// Every entry chained from slot `index`, whatever its hash.
    pub fn bucket(&self, index: usize) -> Chain<'_, 'a> {
        let (next, error) = match self.slot(index) {
            Ok(next) => (next, None),
            Err(e) => (0, Some(e)),
        };
        Chain {
            table: self,
            slot: index,
            next,
            error,
            remaining: (self.bytes.len() - self.entries_start) / HE_TUPLE + 1,
        }
    }

    /// The chain `hash` lands in. Entries with other hashes may share it.
    pub fn chain(&self, hash: u32) -> Chain<'_, 'a> {
        self.bucket(self.slot_index(hash))
    }
}

/// Forward walk over one bucket. Stops with [`LayoutError::ChainCycle`]
/// once it has visited more entries than the table can hold.
pub struct Chain<'t, 'a> {
    table: &'t HashTableView<'a>,
    slot: usize,
    next: u32,
    error: Option<LayoutError>,
    remaining: usize,
}

impl<'a> Iterator for Chain<'_, 'a> {
    type Item = Result<HashEntryView<'a>, LayoutError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            self.next = 0;
            return Some(Err(e));
        }
        if self.next == 0 {
            return None;
        }
        if self.remaining == 0 {
            self.next = 0;
            return Some(Err(LayoutError::ChainCycle { slot: self.slot }));
        }
        self.remaining -= 1;
        match self.table.entry_at(self.next) {
            Ok(entry) => {
                self.next = entry.next;
                Some(Ok(entry))
            }
            Err(e) => {
                self.next = 0;
                Some(Err(e))
            }
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct HashEntryView<'a> {
    offset: u32,
    next: u32,
    hash: u32,
    rowid: u32,
    tuple: &'a [u8],
}

impl<'a> HashEntryView<'a> {
    /// Offset of this entry relative to its table.
    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline(always)]
    pub fn next(&self) -> u32 {
        self.next
    }

    #[inline(always)]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    #[inline(always)]
    pub fn rowid(&self) -> u32 {
        self.rowid
    }

    #[inline(always)]
    pub fn t_len(&self) -> usize {
        self.tuple.len()
    }

    #[inline(always)]
    pub fn tuple_bytes(&self) -> &'a [u8] {
        self.tuple
    }

    pub fn tuple(&self) -> Result<TupleRef<'a>, LayoutError> {
        TupleRef::new(self.tuple)
    }
}

/// Owned multi-hash region.
#[derive(Clone, Debug)]
pub struct MultiHashTable {
    bytes: Vec<u8>,
}

impl MultiHashTable {
    /// Adopt a region received from elsewhere; validated on `view`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn view(&self) -> Result<MultiHashView<'_>, LayoutError> {
        MultiHashView::new(&self.bytes)
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline(always)]
    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    pub fn hostptr(&self) -> u64 {
        read_u64(&self.bytes, MH_HOSTPTR).unwrap_or(0)
    }
}

/// Slot width for `num_entries` entries: ~1.125n rounded up to a power of
/// two, minimum 16.
fn compute_slot_width(num_entries: usize) -> usize {
    let min_size = 16_usize;
    let target = (num_entries + (num_entries / 8)).max(min_size);
    target.next_power_of_two()
}

struct PendingEntry {
    hash: u32,
    rowid: u32,
    tuple: Vec<u8>,
}

/// Packs already-collected inner rows into the table layout.
pub struct HashTableBuilder {
    colmeta: Vec<ColumnMeta>,
    nslots: Option<usize>,
    is_outer: bool,
    entries: Vec<PendingEntry>,
}

impl HashTableBuilder {
    pub fn new(colmeta: Vec<ColumnMeta>) -> Self {
        Self {
            colmeta,
            nslots: None,
            is_outer: false,
            entries: Vec::new(),
        }
    }

    pub fn with_slots(colmeta: Vec<ColumnMeta>, nslots: usize) -> Self {
        let mut b = Self::new(colmeta);
        b.nslots = Some(nslots.max(1));
        b
    }

    /// Mark the table as the inner side of an outer join.
    pub fn outer(mut self) -> Self {
        self.is_outer = true;
        self
    }

    pub fn colmeta(&self) -> &[ColumnMeta] {
        &self.colmeta
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a pre-formed tuple under `hash`.
    pub fn insert(&mut self, hash: u32, rowid: u32, tuple: Vec<u8>) {
        self.entries.push(PendingEntry { hash, rowid, tuple });
    }

    /// Form a tuple from `datums` and hash it on `key_cols`. Key values the
    /// device cannot read must be expanded by the caller first; `insert`
    /// takes a host-computed hash for those.
    pub fn insert_row(
        &mut self,
        rowid: u32,
        datums: &[Option<&[u8]>],
        key_cols: &[usize],
    ) -> Result<u32, LayoutError> {
        let mut h = HashKey::new();
        for &col in key_cols {
            let cmeta = self.colmeta.get(col).ok_or_else(|| {
                LayoutError::malformed("hash key", format!("column {col} out of range"))
            })?;
            match KeyDatum::read(cmeta, datums.get(col).copied().flatten())? {
                KeyDatum::NeedsHost => {
                    return Err(LayoutError::malformed(
                        "hash key",
                        format!("column {col} is compressed or external"),
                    ));
                }
                key => h.update(key),
            }
        }
        let hash = h.finish();
        let tuple = form_tuple(&self.colmeta, datums)?;
        self.insert(hash, rowid, tuple);
        Ok(hash)
    }

    fn nslots(&self) -> usize {
        self.nslots
            .unwrap_or_else(|| compute_slot_width(self.entries.len()))
    }

    fn encoded_len(&self) -> usize {
        entries_offset(self.colmeta.len(), self.nslots())
            + self
                .entries
                .iter()
                .map(|e| hash_entry_size(e.tuple.len()))
                .sum::<usize>()
    }

    /// Write the table into `buf`, which starts at the table base.
    fn encode_into(&self, buf: &mut [u8]) -> Result<(), LayoutError> {
        let ncols = self.colmeta.len();
        let nslots = self.nslots();
        write_u32(buf, HT_NCOLS, ncols as u32)?;
        write_u32(buf, HT_NSLOTS, nslots as u32)?;
        write_u8(buf, HT_IS_OUTER, self.is_outer as u8)?;
        for (i, cmeta) in self.colmeta.iter().enumerate() {
            cmeta.encode_into(buf, HT_COLMETA + ColumnMeta::ENCODED_LEN * i)?;
        }
        let slots = slot_array_offset(ncols);
        let mut cursor = entries_offset(ncols, nslots);
        for e in &self.entries {
            let slot_pos = slots + size_of::<u32>() * (e.hash as usize % nslots);
            let head = read_u32(buf, slot_pos)?;
            write_u32(buf, cursor + HE_NEXT, head)?;
            write_u32(buf, cursor + HE_HASH, e.hash)?;
            write_u32(buf, cursor + HE_ROWID, e.rowid)?;
            write_u32(buf, cursor + HE_TLEN, e.tuple.len() as u32)?;
            write_bytes(buf, cursor + HE_TUPLE, &e.tuple)?;
            write_u32(buf, slot_pos, cursor as u32)?;
            cursor += hash_entry_size(e.tuple.len());
        }
        Ok(())
    }
}

/// Packs several [`HashTableBuilder`]s into one region.
pub struct MultiHashBuilder {
    hostptr: u64,
    tables: Vec<HashTableBuilder>,
}

impl MultiHashBuilder {
    pub fn new(hostptr: u64) -> Self {
        Self {
            hostptr,
            tables: Vec::new(),
        }
    }

    /// Append a table; returns its depth.
    pub fn add_table(&mut self, table: HashTableBuilder) -> usize {
        self.tables.push(table);
        self.tables.len()
    }

    pub fn finish(self) -> Result<MultiHashTable, LayoutError> {
        let ntables = self.tables.len();
        let mut offsets = Vec::with_capacity(ntables);
        let mut length = multihash_header_len(ntables);
        for t in &self.tables {
            offsets.push(length);
            length = stromalign(length + t.encoded_len());
        }
        if u32::try_from(length).is_err() {
            return Err(LayoutError::malformed(
                "multihash",
                format!("{length} bytes exceed the 32-bit offset range"),
            ));
        }
        let mut bytes = vec![0u8; length];
        write_u64(&mut bytes, MH_HOSTPTR, self.hostptr)?;
        write_u32(&mut bytes, MH_LENGTH, length as u32)?;
        write_u32(&mut bytes, MH_NTABLES, ntables as u32)?;
        for (i, (t, &off)) in self.tables.iter().zip(&offsets).enumerate() {
            write_u32(&mut bytes, MH_OFFSETS + size_of::<u32>() * (i + 1), off as u32)?;
            t.encode_into(&mut bytes[off..])?;
        }
        Ok(MultiHashTable { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashMap;

    fn int_table(rows: &[(u32, i32)]) -> HashTableBuilder {
        let mut t = HashTableBuilder::new(vec![ColumnMeta::int4()]);
        for &(rowid, key) in rows {
            t.insert_row(rowid, &[Some(&key.to_le_bytes()[..])], &[0]).unwrap();
        }
        t
    }

    #[test]
    fn sizing_basics() {
        assert_eq!(compute_slot_width(0), 16);
        for n in [100, 10_000, 1_000_000] {
            let size = compute_slot_width(n);
            assert!(size.is_power_of_two());
            assert!(size >= n);
        }
    }

    #[test]
    fn header_and_offsets() {
        let mut mb = MultiHashBuilder::new(0xdead_0000);
        assert_eq!(mb.add_table(int_table(&[(0, 1)])), 1);
        assert_eq!(mb.add_table(int_table(&[(0, 2), (1, 3)])), 2);
        let mh = mb.finish().unwrap();
        let view = mh.view().unwrap();
        assert_eq!(view.ntables(), 2);
        assert_eq!(view.hostptr(), 0xdead_0000);
        assert_eq!(view.length(), mh.length());
        assert!(view.table_offset(0).is_err());
        assert!(view.table_offset(3).is_err());
        for d in 1..=2 {
            let off = view.table_offset(d).unwrap();
            assert_eq!(off % STROMALIGN_LEN, 0);
            assert_eq!(view.table(d).unwrap().base(), off);
        }
        assert_eq!(view.table(1).unwrap().nslots(), 16);
    }

    #[test]
    fn undecodable_keys_are_rejected_at_insert() {
        let mut t = HashTableBuilder::new(vec![ColumnMeta::varlena()]);
        let compressed = crate::varlena::encode_compressed(3, b"abc");
        assert!(matches!(
            t.insert_row(0, &[Some(&compressed[..])], &[0]),
            Err(LayoutError::Malformed { .. })
        ));
        assert!(t.is_empty());
        // only the key column has to be readable
        let mut t = HashTableBuilder::new(vec![ColumnMeta::int4(), ColumnMeta::varlena()]);
        t.insert_row(0, &[Some(&1i32.to_le_bytes()[..]), Some(&compressed[..])], &[0])
            .unwrap();
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn single_entry_lookup() {
        let mut t = HashTableBuilder::with_slots(vec![ColumnMeta::int4()], 7);
        let tuple = form_tuple(&[ColumnMeta::int4()], &[Some(&42i32.to_le_bytes()[..])]).unwrap();
        t.insert(1234, 7, tuple);
        let mut mb = MultiHashBuilder::new(0);
        mb.add_table(t);
        let mh = mb.finish().unwrap();
        let view = mh.view().unwrap();
        let table = view.table(1).unwrap();
        let e = table.first_entry(1234).unwrap().unwrap();
        assert_eq!(e.hash(), 1234);
        assert_eq!(e.rowid(), 7);
        assert_eq!(e.next(), 0);
        assert_eq!(
            e.tuple().unwrap().datum(table.colmeta(), 0).unwrap(),
            Some(&42i32.to_le_bytes()[..])
        );
        // 1235 % 7 != 1234 % 7
        assert!(table.first_entry(1235).unwrap().is_none());
    }

    #[test]
    fn every_reachable_entry_hashes_to_its_bucket() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let rows: Vec<(u32, i32)> = (0..2_000).map(|i| (i, rng.random_range(0..500))).collect();
        let mut mb = MultiHashBuilder::new(0);
        mb.add_table(int_table(&rows));
        let mh = mb.finish().unwrap();
        let view = mh.view().unwrap();
        let table = view.table(1).unwrap();
        let mut reached = 0;
        for i in 0..table.nslots() {
            for e in table.bucket(i) {
                let e = e.unwrap();
                assert_eq!(e.hash() as usize % table.nslots(), i);
                reached += 1;
            }
        }
        assert_eq!(reached, rows.len());
    }

    #[test]
    fn duplicates_share_a_chain() {
        let rows = [(0, 10), (1, 10), (2, 20), (3, 10)];
        let mut mb = MultiHashBuilder::new(0);
        mb.add_table(int_table(&rows));
        let mh = mb.finish().unwrap();
        let table = mh.view().unwrap().table(1).unwrap();
        let hash = HashKey::of(&[KeyDatum::Value(&10i32.to_le_bytes())]);
        let mut rowids: Vec<u32> = table
            .chain(hash)
            .map(|e| e.unwrap())
            .filter(|e| e.hash() == hash)
            .map(|e| e.rowid())
            .collect();
        rowids.sort();
        assert_eq!(rowids, vec![0, 1, 3]);
    }

    #[test]
    fn chain_cycle_is_detected() {
        let mut t = HashTableBuilder::with_slots(vec![ColumnMeta::int4()], 1);
        let tuple = form_tuple(&[ColumnMeta::int4()], &[Some(&1i32.to_le_bytes()[..])]).unwrap();
        t.insert(5, 0, tuple);
        let mut mb = MultiHashBuilder::new(0);
        mb.add_table(t);
        let mut bytes = mb.finish().unwrap().as_bytes().to_vec();
        let mh = MultiHashTable::from_bytes(bytes.clone());
        let view = mh.view().unwrap();
        let table_off = view.table_offset(1).unwrap();
        let entry_off = view.table(1).unwrap().slot(0).unwrap();
        // Point the entry at itself.
        write_u32(&mut bytes, table_off + entry_off as usize + HE_NEXT, entry_off).unwrap();
        let mh = MultiHashTable::from_bytes(bytes);
        let table = mh.view().unwrap().table(1).unwrap();
        let walked: Vec<_> = table.chain(5).collect();
        assert!(matches!(walked.last(), Some(Err(LayoutError::ChainCycle { slot: 0 }))));
        assert!(walked[..walked.len() - 1].iter().all(|e| e.is_ok()));
    }

    #[test]
    fn corrupt_offsets_are_rejected() {
        let mut mb = MultiHashBuilder::new(0);
        mb.add_table(int_table(&[(0, 1)]));
        let good = mb.finish().unwrap().as_bytes().to_vec();

        let mut bad = good.clone();
        write_u32(&mut bad, MH_OFFSETS + 4, 3).unwrap();
        assert!(MultiHashTable::from_bytes(bad).view().unwrap().table(1).is_err());

        let mut bad = good.clone();
        write_u32(&mut bad, MH_LENGTH, good.len() as u32 + 8).unwrap();
        assert!(MultiHashTable::from_bytes(bad).view().is_err());

        let view_bytes = MultiHashTable::from_bytes(good);
        let table = view_bytes.view().unwrap().table(1).unwrap();
        assert!(table.entry_at(0).is_err());
        assert!(table.entry_at(table.entries_start as u32 + 4).is_err());
    }

    #[test]
    fn relocation_keeps_lookups_valid() {
        let rows: Vec<(u32, i32)> = (0..100).map(|i| (i, i as i32 * 3)).collect();
        let mut mb = MultiHashBuilder::new(0);
        mb.add_table(int_table(&rows));
        let original = mb.finish().unwrap();
        // Copy into a buffer at a different address with a leading prefix.
        let mut moved = vec![0xFFu8; 24];
        moved.extend_from_slice(original.as_bytes());
        let view = MultiHashView::new(&moved[24..]).unwrap();
        let table = view.table(1).unwrap();
        let mut by_key = HashMap::new();
        for i in 0..table.nslots() {
            for e in table.bucket(i) {
                let e = e.unwrap();
                let key = e.tuple().unwrap().datum(table.colmeta(), 0).unwrap().unwrap().to_vec();
                by_key.insert(key, e.rowid());
            }
        }
        for &(rowid, key) in &rows {
            assert_eq!(by_key[&key.to_le_bytes().to_vec()], rowid);
        }
    }
}
