//! The query-specific half of a join: which combinations match and where
//! each destination column comes from.
//!
//! Kernels are generic over [`JoinStrategy`]. [`EquiJoin`] covers chains of
//! equality predicates; anything fancier implements the trait directly.

use crate::data_store::{DataStore, SourceTuple};
use crate::error::{ErrorCode, LayoutError};
use crate::hashkey::{HashKey, KeyDatum};
use crate::multihash::{HE_TUPLE, HashEntryView, HashTableView, MultiHashView};
use crate::request::ParamBuf;
use crate::tuple::{ColumnMeta, TupleRef};

/// Read-only inputs shared by every lane of the execution kernel.
pub struct KernelContext<'a> {
    pub params: &'a ParamBuf,
    pub mhash: MultiHashView<'a>,
    /// Index `d - 1` holds the table at depth `d`.
    pub tables: Vec<HashTableView<'a>>,
    pub kds: &'a DataStore,
}

impl<'a> KernelContext<'a> {
    pub fn new(
        params: &'a ParamBuf,
        mhash: MultiHashView<'a>,
        kds: &'a DataStore,
    ) -> Result<Self, LayoutError> {
        Ok(Self {
            params,
            tables: mhash.tables()?,
            mhash,
            kds,
        })
    }

    #[inline(always)]
    pub fn ntables(&self) -> usize {
        self.tables.len()
    }

    /// Table at `depth`, 1-based.
    pub fn table(&self, depth: usize) -> Result<&HashTableView<'a>, LayoutError> {
        depth
            .checked_sub(1)
            .and_then(|i| self.tables.get(i))
            .ok_or(LayoutError::InvalidDepth {
                depth,
                ntables: self.tables.len(),
            })
    }

    /// Column metadata of the relation at `depth`.
    pub fn colmeta(&self, depth: usize) -> Result<&[ColumnMeta], LayoutError> {
        match depth {
            0 => Ok(self.kds.colmeta()),
            d => Ok(self.table(d)?.colmeta()),
        }
    }

    /// Tuple that `combination` references at `depth`, with its host
    /// address. `None` when the depth holds no row.
    pub fn source_tuple(
        &self,
        combination: &[i32],
        depth: usize,
    ) -> Result<Option<SourceTuple<'a>>, LayoutError> {
        let Some(&reference) = combination.get(depth) else {
            return Ok(None);
        };
        if depth == 0 {
            return match reference.unsigned_abs() as usize {
                0 => Ok(None),
                row => self.kds.get_tuple(row - 1).map(Some),
            };
        }
        if reference <= 0 {
            return Ok(None);
        }
        let table = self.table(depth)?;
        let entry = table.entry_at(reference as u32)?;
        let offset = table.base() + reference as usize + HE_TUPLE;
        Ok(Some(SourceTuple {
            tuple: entry.tuple()?,
            hostaddr: self.mhash.hostptr() + offset as u64,
        }))
    }
}

/// Bounded writer over the result slots reserved for one outer row.
pub struct CombinationWriter<'s> {
    slots: &'s mut [i32],
    nrels: usize,
    written: usize,
}

impl<'s> CombinationWriter<'s> {
    pub fn new(slots: &'s mut [i32], nrels: usize) -> Self {
        Self {
            slots,
            nrels,
            written: 0,
        }
    }

    /// Append one combination of `nrels` references.
    pub fn push(&mut self, combination: &[i32]) -> Result<(), LayoutError> {
        if combination.len() != self.nrels {
            return Err(LayoutError::malformed(
                "combination",
                format!("{} references for {} relations", combination.len(), self.nrels),
            ));
        }
        let start = self.written * self.nrels;
        let size = self.slots.len();
        let dst = self
            .slots
            .get_mut(start..start + self.nrels)
            .ok_or(LayoutError::OutOfBounds {
                offset: start,
                len: self.nrels,
                size,
            })?;
        dst.copy_from_slice(combination);
        self.written += 1;
        Ok(())
    }

    #[inline(always)]
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_slots(self) -> &'s mut [i32] {
        self.slots
    }
}

pub enum ProbeMode<'w, 's> {
    /// Count matches without writing.
    Count,
    /// Write every match; the writer holds exactly the counted rooms.
    Emit(&'w mut CombinationWriter<'s>),
}

/// One destination row of a tuple-slot store.
pub struct SlotRow<'a> {
    pub values: &'a mut [u64],
    pub isnull: &'a mut [bool],
}

/// A non-null source attribute handed to [`JoinStrategy::project_datum`].
#[derive(Copy, Clone, Debug)]
pub struct SlotDatum<'a> {
    pub cmeta: ColumnMeta,
    pub bytes: &'a [u8],
    /// Host address of `bytes[0]`.
    pub hostaddr: u64,
}

impl SlotDatum<'_> {
    /// By-value representation: scalars of 1, 2, 4 or 8 bytes are
    /// sign-extended, everything else is referenced by host address.
    pub fn to_slot_value(&self) -> u64 {
        let b = self.bytes;
        match (self.cmeta.attlen, b.len()) {
            (1, 1) => b[0] as i8 as i64 as u64,
            (2, 2) => i16::from_le_bytes([b[0], b[1]]) as i64 as u64,
            (4, 4) => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64 as u64,
            (8, 8) => u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            _ => self.hostaddr,
        }
    }
}

pub trait JoinStrategy: Sync {
    /// Walk the inner tables for outer row `outer_index`. Returns the number
    /// of full-depth combinations; in emit mode also writes them.
    fn probe(
        &self,
        ctx: &KernelContext<'_>,
        outer_index: usize,
        mode: ProbeMode<'_, '_>,
        errcode: &mut ErrorCode,
    ) -> u32;

    /// Source `(depth, column)` of destination column `dest_index`.
    fn map_column(&self, dest_index: usize) -> (usize, usize);

    /// Store source attribute `(depth, colidx)` into every destination
    /// column it feeds. `None` is a null.
    fn project_datum(
        &self,
        row: &mut SlotRow<'_>,
        depth: usize,
        colidx: usize,
        datum: Option<SlotDatum<'_>>,
        _errcode: &mut ErrorCode,
    ) {
        for dest in 0..row.values.len() {
            if self.map_column(dest) != (depth, colidx) {
                continue;
            }
            match datum {
                None => {
                    row.values[dest] = 0;
                    row.isnull[dest] = true;
                }
                Some(d) => {
                    row.values[dest] = d.to_slot_value();
                    row.isnull[dest] = false;
                }
            }
        }
    }
}

/// An attribute of an earlier depth feeding a join key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyRef {
    pub depth: usize,
    pub colidx: usize,
}

/// Equality of `source` with column `inner_col` of the table being probed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub source: KeyRef,
    pub inner_col: usize,
}

impl KeyPair {
    pub fn new(source_depth: usize, source_col: usize, inner_col: usize) -> Self {
        Self {
            source: KeyRef {
                depth: source_depth,
                colidx: source_col,
            },
            inner_col,
        }
    }
}

/// Inner joins on conjunctions of key equalities, one key list per depth.
///
/// A null key never matches. A key only the host can read makes every
/// candidate of its probe match, flagged for recheck. A depth without keys
/// is a cross join with every entry of its table.
#[derive(Clone, Debug, Default)]
pub struct EquiJoin {
    keys: Vec<Vec<KeyPair>>,
    projection: Vec<(usize, usize)>,
}

/// Tuples chosen so far along one probe path, index = depth.
struct Path<'a> {
    outer: TupleRef<'a>,
    inner: Vec<HashEntryView<'a>>,
}

impl<'a> Path<'a> {
    fn tuple(&self, depth: usize) -> Result<TupleRef<'a>, LayoutError> {
        match depth {
            0 => Ok(self.outer),
            d => self
                .inner
                .get(d - 1)
                .ok_or(LayoutError::InvalidDepth {
                    depth: d,
                    ntables: self.inner.len(),
                })?
                .tuple(),
        }
    }
}

enum KeyMatch {
    No,
    Yes,
    Recheck,
}

impl EquiJoin {
    /// `projection[dest] = (depth, column)`.
    pub fn new(projection: Vec<(usize, usize)>) -> Self {
        Self {
            keys: Vec::new(),
            projection,
        }
    }

    /// Join the table at `depth` on `pairs`.
    pub fn on(mut self, depth: usize, pairs: Vec<KeyPair>) -> Self {
        debug_assert!(depth > 0, "depth 0 is the outer relation");
        if depth == 0 {
            return self;
        }
        if self.keys.len() < depth {
            self.keys.resize(depth, Vec::new());
        }
        self.keys[depth - 1] = pairs;
        self
    }

    pub fn projection(&self) -> &[(usize, usize)] {
        &self.projection
    }

    fn source_key<'p>(
        ctx: &KernelContext<'_>,
        path: &Path<'p>,
        key: KeyRef,
    ) -> Result<KeyDatum<'p>, LayoutError> {
        let colmeta = ctx.colmeta(key.depth)?;
        let cmeta = colmeta.get(key.colidx).ok_or_else(|| {
            LayoutError::malformed("join key", format!("column {} out of range", key.colidx))
        })?;
        let tuple = path.tuple(key.depth)?;
        KeyDatum::read(cmeta, tuple.datum(colmeta, key.colidx)?)
    }

    fn compare(
        table: &HashTableView<'_>,
        entry: &HashEntryView<'_>,
        pairs: &[KeyPair],
        sources: &[KeyDatum<'_>],
    ) -> Result<KeyMatch, LayoutError> {
        let tuple = entry.tuple()?;
        let mut result = KeyMatch::Yes;
        for (pair, source) in pairs.iter().zip(sources) {
            let cmeta = table.colmeta().get(pair.inner_col).ok_or_else(|| {
                let detail = format!("inner column {} out of range", pair.inner_col);
                LayoutError::malformed("join key", detail)
            })?;
            let inner = KeyDatum::read(cmeta, tuple.datum(table.colmeta(), pair.inner_col)?)?;
            match (source, inner) {
                (KeyDatum::Null, _) | (_, KeyDatum::Null) => return Ok(KeyMatch::No),
                (KeyDatum::NeedsHost, _) | (_, KeyDatum::NeedsHost) => result = KeyMatch::Recheck,
                (KeyDatum::Value(a), KeyDatum::Value(b)) if *a == b => {}
                _ => return Ok(KeyMatch::No),
            }
        }
        Ok(result)
    }

    fn walk<'a>(
        &self,
        ctx: &KernelContext<'a>,
        outer_index: usize,
        depth: usize,
        path: &mut Path<'a>,
        writer: &mut Option<&mut CombinationWriter<'_>>,
        errcode: &mut ErrorCode,
    ) -> Result<u32, LayoutError> {
        if depth > ctx.ntables() {
            if let Some(w) = writer.as_deref_mut() {
                let mut combination = Vec::with_capacity(depth);
                combination.push(outer_index as i32 + 1);
                combination.extend(path.inner.iter().map(|e| e.offset() as i32));
                w.push(&combination)?;
            }
            return Ok(1);
        }
        let table = ctx.table(depth)?;
        let pairs = self.keys.get(depth - 1).map(Vec::as_slice).unwrap_or_default();
        let sources = pairs
            .iter()
            .map(|p| Self::source_key(ctx, path, p.source))
            .collect::<Result<Vec<_>, _>>()?;
        if sources.contains(&KeyDatum::Null) {
            return Ok(0);
        }

        let mut nmatches = 0;
        let host_only = sources.contains(&KeyDatum::NeedsHost);
        if host_only || pairs.is_empty() {
            if host_only {
                errcode.set(ErrorCode::CpuReCheck);
            }
            for slot in 0..table.nslots() {
                for entry in table.bucket(slot) {
                    let entry = entry?;
                    if let KeyMatch::No = Self::compare(table, &entry, pairs, &sources)? {
                        continue;
                    }
                    path.inner.push(entry);
                    let n = self.walk(ctx, outer_index, depth + 1, path, writer, errcode);
                    path.inner.pop();
                    nmatches += n?;
                }
            }
            return Ok(nmatches);
        }

        let mut h = HashKey::new();
        for &k in &sources {
            h.update(k);
        }
        let hash = h.finish();
        for entry in table.chain(hash) {
            let entry = entry?;
            if entry.hash() != hash {
                continue;
            }
            match Self::compare(table, &entry, pairs, &sources)? {
                KeyMatch::No => continue,
                KeyMatch::Recheck => errcode.set(ErrorCode::CpuReCheck),
                KeyMatch::Yes => {}
            }
            path.inner.push(entry);
            let n = self.walk(ctx, outer_index, depth + 1, path, writer, errcode);
            path.inner.pop();
            nmatches += n?;
        }
        Ok(nmatches)
    }
}

impl JoinStrategy for EquiJoin {
    fn probe(
        &self,
        ctx: &KernelContext<'_>,
        outer_index: usize,
        mode: ProbeMode<'_, '_>,
        errcode: &mut ErrorCode,
    ) -> u32 {
        let outer = match ctx.kds.get_tuple(outer_index) {
            Ok(t) => t.tuple,
            Err(_) => {
                errcode.set(ErrorCode::DataStoreCorruption);
                return 0;
            }
        };
        let mut path = Path {
            outer,
            inner: Vec::with_capacity(ctx.ntables()),
        };
        let mut writer = match mode {
            ProbeMode::Count => None,
            ProbeMode::Emit(w) => Some(w),
        };
        match self.walk(ctx, outer_index, 1, &mut path, &mut writer, errcode) {
            Ok(n) => n,
            Err(_) => {
                errcode.set(ErrorCode::DataStoreCorruption);
                0
            }
        }
    }

    fn map_column(&self, dest_index: usize) -> (usize, usize) {
        self.projection
            .get(dest_index)
            .copied()
            .unwrap_or((usize::MAX, usize::MAX))
    }
}
