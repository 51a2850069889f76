//! Projection of join results into a flat row store.
//!
//! Each lane assembles one destination tuple. Tuples are packed from the end
//! of the arena towards its head, so a group reserves its bytes with a single
//! `fetch_add` on the destination usage before any lane writes.

use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::data_store::{DataStore, FlatParts, StoreFormat};
use crate::device::{LaunchConfig, WorkGroup, launch, stairlike_add, writeback_error_status};
use crate::error::{ErrorCode, JoinError, LayoutError, Result};
use crate::multihash::MultiHashTable;
use crate::request::{HashJoinRequest, ResultHeader};
use crate::strategy::{JoinStrategy, KernelContext};
use crate::tuple::{TupleLayout, fill_tuple, tuple_layout};

/// Gather the destination datums of `combination` and size the tuple.
fn prepare_tuple<'a, S: JoinStrategy>(
    ctx: &KernelContext<'a>,
    strategy: &S,
    dest: &FlatParts<'_>,
    combination: &[i32],
) -> Result<(Vec<Option<&'a [u8]>>, TupleLayout, u32), LayoutError> {
    let mut datums = Vec::with_capacity(dest.colmeta.len());
    for dest_index in 0..dest.colmeta.len() {
        let (depth, colidx) = strategy.map_column(dest_index);
        let datum = match ctx.source_tuple(combination, depth) {
            Ok(Some(src)) => src.tuple.datum(ctx.colmeta(depth)?, colidx)?,
            Ok(None) => None,
            // unmapped destination columns come out null
            Err(LayoutError::InvalidDepth { .. }) => None,
            Err(e) => return Err(e),
        };
        datums.push(datum);
    }
    let layout = tuple_layout(dest.colmeta, &datums, dest.has_oid)?;
    let required = u32::try_from(layout.required)
        .map_err(|_| LayoutError::malformed("tuple", format!("{} bytes", layout.required)))?;
    Ok((datums, layout, required))
}

fn run_group<S: JoinStrategy>(
    wg: &WorkGroup,
    ctx: &KernelContext<'_>,
    strategy: &S,
    header: &ResultHeader,
    results: &[i32],
    nitems: usize,
    dest: &FlatParts<'_>,
) {
    let nlanes = wg.local_size;
    let nrels = header.nrels() as usize;
    let mut codes = vec![ErrorCode::Success; nlanes];
    let mut prepared = Vec::with_capacity(nlanes);
    let mut required = vec![0u32; nlanes];

    for lane in wg.lanes() {
        let gid = wg.global_id(lane);
        if gid >= nitems {
            prepared.push(None);
            continue;
        }
        let combination = &results[gid * nrels..(gid + 1) * nrels];
        match prepare_tuple(ctx, strategy, dest, combination) {
            Ok((datums, layout, len)) => {
                required[lane] = len;
                prepared.push(Some((datums, layout)));
            }
            Err(_) => {
                codes[lane].set(ErrorCode::DataStoreCorruption);
                prepared.push(None);
            }
        }
    }

    let mut offsets = vec![0u32; nlanes];
    let total = stairlike_add(&required, &mut offsets);
    let usage_prev = if total > 0 {
        dest.usage.fetch_add(total, Ordering::AcqRel)
    } else {
        0
    };
    trace!(group = wg.group_id, usage_prev, total, "reserved destination bytes");

    let usage_head = DataStore::flat_head_len(dest.colmeta.len(), nitems) as u64;
    if usage_head + usage_prev as u64 + total as u64 > dest.length as u64 {
        codes[0].set(ErrorCode::DataStoreNoSpace);
        writeback_error_status(header.errcode_cell(), &codes);
        return;
    }

    for (lane, slot) in prepared.iter().enumerate() {
        let Some((datums, layout)) = slot else {
            continue;
        };
        let gid = wg.global_id(lane);
        let htup_offset = dest.length - (usage_prev + offsets[lane] + required[lane]);
        // SAFETY: the group owns `total` bytes below `length - usage_prev`
        // and the exclusive scan splits them between lanes; `gid` is unique
        // to this lane.
        let buf = unsafe {
            dest.rowitems
                .write(gid, htup_offset)
                .and_then(|()| dest.arena.slice_mut(htup_offset as usize, layout.required))
        };
        let placed = buf.and_then(|buf| {
            fill_tuple(buf, dest.colmeta, datums, layout, dest.typeid, dest.typmod)
        });
        if placed.is_err() {
            codes[lane].set(ErrorCode::DataStoreCorruption);
        }
    }

    writeback_error_status(header.errcode_cell(), &codes);
}

/// Assemble one tuple of `kds_dest` per combination in the result buffer of
/// `request`. Columns are picked by [`JoinStrategy::map_column`]; a column
/// whose source depth holds no row is null. Returns the number of tuples.
pub fn gpuhashjoin_projection_row<S: JoinStrategy>(
    config: &LaunchConfig,
    request: &HashJoinRequest,
    mhash: &MultiHashTable,
    kds: &DataStore,
    kds_dest: &mut DataStore,
    strategy: &S,
) -> Result<u32> {
    let result = request.result();
    let header = result.header();
    let errcode = header.errcode_cell();

    if !kds.format().is_row() || kds_dest.format() != StoreFormat::RowFlat {
        warn!(
            source = ?kds.format(),
            dest = ?kds_dest.format(),
            "row projection needs a row source and a flat destination"
        );
        writeback_error_status(errcode, &[ErrorCode::DataStoreCorruption]);
        return header.status();
    }

    let nitems = header.nitems();
    if nitems > header.nrooms() || nitems > kds_dest.nrooms() {
        warn!(
            nitems,
            nrooms = header.nrooms(),
            dest_nrooms = kds_dest.nrooms(),
            "combinations do not fit the destination"
        );
        writeback_error_status(errcode, &[ErrorCode::DataStoreNoSpace]);
        return Err(JoinError::NoSpace {
            required: nitems as u64,
            capacity: header.nrooms().min(kds_dest.nrooms()) as u64,
        });
    }

    let ctx = match mhash
        .view()
        .and_then(|view| KernelContext::new(request.params(), view, kds))
    {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "malformed hash tables");
            writeback_error_status(errcode, &[ErrorCode::DataStoreCorruption]);
            return header.status();
        }
    };
    let dest = match kds_dest.flat_parts() {
        Ok(dest) => dest,
        Err(e) => {
            warn!(error = %e, "malformed destination store");
            writeback_error_status(errcode, &[ErrorCode::DataStoreCorruption]);
            return header.status();
        }
    };

    debug!(
        nitems,
        ncols = dest.colmeta.len(),
        length = dest.length,
        "gpuhashjoin_projection_row"
    );
    dest.nitems.store(nitems, Ordering::Release);
    let results = result.raw_results();
    let nitems = nitems as usize;
    launch(config, nitems, |wg| {
        run_group(wg, &ctx, strategy, header, results, nitems, &dest)
    });

    let head = DataStore::flat_head_len(dest.colmeta.len(), nitems) as u64;
    let usage = dest.usage.load(Ordering::Acquire) as u64;
    match header.errcode() {
        ErrorCode::DataStoreNoSpace => {
            warn!(required = head + usage, length = dest.length, "destination arena too small");
            Err(JoinError::NoSpace {
                required: head + usage,
                capacity: dest.length as u64,
            })
        }
        ErrorCode::DataStoreCorruption => {
            warn!("row projection reported corruption");
            header.status()
        }
        _ => Ok(nitems as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::gpuhashjoin_main;
    use crate::multihash::{HashTableBuilder, MultiHashBuilder};
    use crate::request::{ParamBuf, ResultBuffer};
    use crate::strategy::{EquiJoin, KeyPair};
    use crate::tuple::{ColumnMeta, form_tuple};
    use crate::varlena;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    /// Decoded destination row: key, outer label, inner amount, inner note.
    type Row = (i32, Option<Vec<u8>>, Option<i64>, Option<Vec<u8>>);

    fn outer_meta() -> Vec<ColumnMeta> {
        vec![ColumnMeta::int4(), ColumnMeta::varlena()]
    }

    fn inner_meta() -> Vec<ColumnMeta> {
        vec![ColumnMeta::int4(), ColumnMeta::int8(), ColumnMeta::varlena()]
    }

    fn dest_meta() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta::int4(),
            ColumnMeta::varlena(),
            ColumnMeta::int8(),
            ColumnMeta::varlena(),
        ]
    }

    fn projection() -> EquiJoin {
        EquiJoin::new(vec![(0, 0), (0, 1), (1, 1), (1, 2)]).on(1, vec![KeyPair::new(0, 0, 0)])
    }

    struct Fixture {
        outer: Vec<(i32, Option<Vec<u8>>)>,
        inner: Vec<(i32, Option<i64>, Option<Vec<u8>>)>,
        kds: DataStore,
        mh: MultiHashTable,
    }

    fn fixture(seed: u64, nouter: usize, ninner: usize) -> Fixture {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let label = |rng: &mut ChaCha8Rng| {
            rng.random_bool(0.8).then(|| {
                let len = rng.random_range(0..200);
                (0..len).map(|_| rng.random_range(b'a'..=b'z')).collect::<Vec<u8>>()
            })
        };

        let outer: Vec<_> = (0..nouter)
            .map(|_| (rng.random_range(0..16i32), label(&mut rng)))
            .collect();
        let inner: Vec<_> = (0..ninner)
            .map(|_| {
                let amount = rng.random_bool(0.7).then(|| rng.random::<i64>());
                (rng.random_range(0..16i32), amount, label(&mut rng))
            })
            .collect();

        let mut kds = DataStore::row_blocks(outer_meta(), 0);
        for (b, chunk) in outer.chunks(32).enumerate() {
            let tuples: Vec<_> = chunk
                .iter()
                .map(|(k, l)| {
                    let key = k.to_le_bytes();
                    let l = l.as_deref().map(varlena::encode);
                    form_tuple(&outer_meta(), &[Some(&key[..]), l.as_deref()]).unwrap()
                })
                .collect();
            kds.append_block(0x4000_0000 + 0x1_0000 * b as u64, &tuples).unwrap();
        }

        let mut t = HashTableBuilder::new(inner_meta());
        for (rowid, (k, amount, note)) in inner.iter().enumerate() {
            let key = k.to_le_bytes();
            let amount = amount.map(i64::to_le_bytes);
            let note = note.as_deref().map(varlena::encode);
            t.insert_row(
                rowid as u32,
                &[Some(&key[..]), amount.as_ref().map(|a| &a[..]), note.as_deref()],
                &[0],
            )
            .unwrap();
        }
        let mut mb = MultiHashBuilder::new(0x7000_0000);
        mb.add_table(t);
        Fixture {
            outer,
            inner,
            kds,
            mh: mb.finish().unwrap(),
        }
    }

    fn expected_rows(f: &Fixture) -> Vec<Row> {
        let mut rows = Vec::new();
        for (k, label) in &f.outer {
            for (ik, amount, note) in &f.inner {
                if k == ik {
                    rows.push((*k, label.clone(), *amount, note.clone()));
                }
            }
        }
        rows.sort();
        rows
    }

    fn decode_rows(dest: &DataStore) -> Vec<Row> {
        let meta = dest.colmeta();
        let mut rows: Vec<Row> = (0..dest.nitems() as usize)
            .map(|i| {
                let t = dest.flat_tuple(i).unwrap();
                let key = t.datum(meta, 0).unwrap().unwrap();
                let text = |v: &[u8]| varlena::vardata_any(v).unwrap().to_vec();
                let label = t.datum(meta, 1).unwrap().map(text);
                let amount = t
                    .datum(meta, 2)
                    .unwrap()
                    .map(|v| i64::from_le_bytes(v.try_into().unwrap()));
                let note = t.datum(meta, 3).unwrap().map(text);
                (i32::from_le_bytes(key.try_into().unwrap()), label, amount, note)
            })
            .collect();
        rows.sort();
        rows
    }

    fn run_join(f: &Fixture, cfg: &LaunchConfig) -> HashJoinRequest {
        let nrooms = (f.outer.len() * f.inner.len()) as u32;
        let mut req = HashJoinRequest::new(ParamBuf::new(&[]), ResultBuffer::new(2, nrooms), None);
        gpuhashjoin_main(cfg, &mut req, &f.mh, &f.kds, &projection()).unwrap();
        req
    }

    #[test]
    fn projected_rows_match_joined_values() {
        let f = fixture(3, 120, 40);
        let cfg = LaunchConfig::with_workers(16, 3);
        let req = run_join(&f, &cfg);
        let n = req.result().header().nitems();

        let mut dest = DataStore::row_flat(dest_meta(), n, 1 << 20, 0x9000_0000);
        let projected =
            gpuhashjoin_projection_row(&cfg, &req, &f.mh, &f.kds, &mut dest, &projection());
        assert_eq!(projected, Ok(n));
        assert_eq!(dest.nitems(), n);
        assert_eq!(decode_rows(&dest), expected_rows(&f));
    }

    #[test]
    fn null_columns_set_the_bitmap() {
        let meta = outer_meta();
        let mut kds = DataStore::row_flat(meta.clone(), 1, 1024, 0);
        kds.insert_tuple(&form_tuple(&meta, &[Some(&5i32.to_le_bytes()[..]), None]).unwrap())
            .unwrap();
        let mut t = HashTableBuilder::new(inner_meta());
        t.insert_row(0, &[Some(&5i32.to_le_bytes()[..]), None, None], &[0]).unwrap();
        let mut mb = MultiHashBuilder::new(0);
        mb.add_table(t);
        let mh = mb.finish().unwrap();

        let cfg = LaunchConfig::with_workers(4, 1);
        let mut req = HashJoinRequest::new(ParamBuf::new(&[]), ResultBuffer::new(2, 1), None);
        assert_eq!(gpuhashjoin_main(&cfg, &mut req, &mh, &kds, &projection()), Ok(1));

        let mut dest = DataStore::row_flat(dest_meta(), 1, 1024, 0).with_type(77, 3);
        assert_eq!(
            gpuhashjoin_projection_row(&cfg, &req, &mh, &kds, &mut dest, &projection()),
            Ok(1)
        );
        let t = dest.flat_tuple(0).unwrap();
        assert!(t.has_nulls());
        assert!(!t.is_null(0));
        assert!(t.is_null(1) && t.is_null(2) && t.is_null(3));
        assert_eq!(t.datum(dest.colmeta(), 0).unwrap(), Some(&5i32.to_le_bytes()[..]));
    }

    #[test]
    fn arena_overflow_is_no_space() {
        let f = fixture(9, 64, 32);
        let cfg = LaunchConfig::with_workers(8, 2);
        let req = run_join(&f, &cfg);
        let n = req.result().header().nitems();
        assert!(n > 0);

        let length = DataStore::flat_head_len(dest_meta().len(), n as usize) as u32 + 64;
        let mut dest = DataStore::row_flat(dest_meta(), n, length, 0);
        let res = gpuhashjoin_projection_row(&cfg, &req, &f.mh, &f.kds, &mut dest, &projection());
        assert!(matches!(res, Err(JoinError::NoSpace { .. })));
        assert!(res.unwrap_err().is_retryable());
        assert_eq!(req.result().errcode(), ErrorCode::DataStoreNoSpace);
    }

    #[test]
    fn too_few_rooms_writes_nothing() {
        let f = fixture(5, 32, 16);
        let cfg = LaunchConfig::with_workers(8, 2);
        let req = run_join(&f, &cfg);
        let n = req.result().header().nitems();
        assert!(n > 1);

        let mut dest = DataStore::row_flat(dest_meta(), n - 1, 1 << 20, 0);
        let res = gpuhashjoin_projection_row(&cfg, &req, &f.mh, &f.kds, &mut dest, &projection());
        assert!(matches!(res, Err(JoinError::NoSpace { .. })));
        assert_eq!(dest.nitems(), 0);
        assert_eq!(dest.usage(), 0);
    }

    #[test]
    fn wrong_formats_are_corruption() {
        let f = fixture(1, 8, 8);
        let cfg = LaunchConfig::with_workers(4, 1);
        let req = run_join(&f, &cfg);

        let mut slots = DataStore::tuple_slot(dest_meta(), 64, 0);
        let res = gpuhashjoin_projection_row(&cfg, &req, &f.mh, &f.kds, &mut slots, &projection());
        assert!(matches!(res, Err(JoinError::Corruption(_))));

        let req = run_join(&f, &cfg);
        let mut blocks = DataStore::row_blocks(dest_meta(), 0);
        let res = gpuhashjoin_projection_row(&cfg, &req, &f.mh, &f.kds, &mut blocks, &projection());
        assert!(matches!(res, Err(JoinError::Corruption(_))));
    }

    #[test]
    fn rechecked_combinations_project_their_outer_row() {
        let meta = vec![ColumnMeta::varlena()];
        let plain = varlena::encode(b"k");
        let compressed = varlena::encode_compressed(1, b"k");
        let mut t = HashTableBuilder::new(meta.clone());
        t.insert_row(0, &[Some(&plain[..])], &[0]).unwrap();
        let mut mb = MultiHashBuilder::new(0);
        mb.add_table(t);
        let mh = mb.finish().unwrap();

        let mut kds = DataStore::row_flat(meta.clone(), 1, 1024, 0);
        kds.insert_tuple(&form_tuple(&meta, &[Some(&compressed[..])]).unwrap()).unwrap();
        let join = EquiJoin::new(vec![(0, 0), (1, 0)]).on(1, vec![KeyPair::new(0, 0, 0)]);

        let cfg = LaunchConfig::with_workers(2, 1);
        let mut req = HashJoinRequest::new(ParamBuf::new(&[]), ResultBuffer::new(2, 2), None);
        assert_eq!(gpuhashjoin_main(&cfg, &mut req, &mh, &kds, &join), Ok(1));
        assert_eq!(req.result().raw_results()[0], -1);

        let dest_meta = vec![ColumnMeta::varlena(), ColumnMeta::varlena()];
        let mut dest = DataStore::row_flat(dest_meta.clone(), 1, 1024, 0);
        assert_eq!(gpuhashjoin_projection_row(&cfg, &req, &mh, &kds, &mut dest, &join), Ok(1));
        let t = dest.flat_tuple(0).unwrap();
        assert_eq!(t.datum(&dest_meta, 0).unwrap(), Some(&compressed[..]));
        assert_eq!(t.datum(&dest_meta, 1).unwrap(), Some(&plain[..]));
    }

    /// Outer keys joined to t1 on t1.c0 and t1.c1 joined to t2 on t2.c0.
    /// Destination: outer key, t1.c1, t2.c1.
    fn two_table_join() -> (DataStore, MultiHashTable, EquiJoin, Vec<(i32, i32, i64)>) {
        let outer = [1i32, 2, 3];
        let t1 = [(1i32, 10i32), (1, 10), (1, 11), (2, 20), (3, 99)];
        let t2 = [(10i32, 100i64), (11, 110), (20, 200), (10, 101)];

        let int4 = [ColumnMeta::int4()];
        let tuples: Vec<_> = outer
            .iter()
            .map(|k| form_tuple(&int4, &[Some(&k.to_le_bytes()[..])]).unwrap())
            .collect();
        let mut kds = DataStore::row_blocks(int4.to_vec(), 0);
        kds.append_block(0x1000, &tuples).unwrap();

        let mut b1 = HashTableBuilder::new(vec![ColumnMeta::int4(), ColumnMeta::int4()]);
        for (rowid, (k, p)) in t1.iter().enumerate() {
            let datums = [Some(&k.to_le_bytes()[..]), Some(&p.to_le_bytes()[..])];
            b1.insert_row(rowid as u32, &datums, &[0]).unwrap();
        }
        let mut b2 = HashTableBuilder::new(vec![ColumnMeta::int4(), ColumnMeta::int8()]);
        for (rowid, (k, v)) in t2.iter().enumerate() {
            let datums = [Some(&k.to_le_bytes()[..]), Some(&v.to_le_bytes()[..])];
            b2.insert_row(rowid as u32, &datums, &[0]).unwrap();
        }
        let mut mb = MultiHashBuilder::new(0x2000_0000);
        mb.add_table(b1);
        mb.add_table(b2);

        let join = EquiJoin::new(vec![(0, 0), (1, 1), (2, 1)])
            .on(1, vec![KeyPair::new(0, 0, 0)])
            .on(2, vec![KeyPair::new(1, 1, 0)]);
        let mut expected = Vec::new();
        for o in outer {
            for (k1, p1) in t1 {
                for (k2, v2) in t2 {
                    if o == k1 && p1 == k2 {
                        expected.push((o, p1, v2));
                    }
                }
            }
        }
        expected.sort();
        (kds, mb.finish().unwrap(), join, expected)
    }

    #[test]
    fn two_tables_project_every_depth() {
        let (kds, mh, join, expected) = two_table_join();
        let cfg = LaunchConfig::with_workers(2, 2);
        let mut req = HashJoinRequest::new(ParamBuf::new(&[]), ResultBuffer::new(3, 16), None);
        let n = gpuhashjoin_main(&cfg, &mut req, &mh, &kds, &join).unwrap();
        assert_eq!(n as usize, expected.len());

        let meta = vec![ColumnMeta::int4(), ColumnMeta::int4(), ColumnMeta::int8()];
        let mut dest = DataStore::row_flat(meta.clone(), n, 4096, 0);
        assert_eq!(gpuhashjoin_projection_row(&cfg, &req, &mh, &kds, &mut dest, &join), Ok(n));
        let mut got: Vec<(i32, i32, i64)> = (0..n as usize)
            .map(|i| {
                let t = dest.flat_tuple(i).unwrap();
                let col = |c| t.datum(&meta, c).unwrap().unwrap();
                (
                    i32::from_le_bytes(col(0).try_into().unwrap()),
                    i32::from_le_bytes(col(1).try_into().unwrap()),
                    i64::from_le_bytes(col(2).try_into().unwrap()),
                )
            })
            .collect();
        got.sort();
        assert_eq!(got, expected);
    }

    #[test]
    fn oversized_header_is_corruption() {
        let (kds, mh, join, _) = two_table_join();
        let cfg = LaunchConfig::with_workers(4, 1);
        let mut req = HashJoinRequest::new(ParamBuf::new(&[]), ResultBuffer::new(3, 16), None);
        let n = gpuhashjoin_main(&cfg, &mut req, &mh, &kds, &join).unwrap();

        // only the first columns are mapped, the rest come out null
        let mut dest = DataStore::row_flat(vec![ColumnMeta::int4(); 2000], n, 1 << 20, 0);
        let res = gpuhashjoin_projection_row(&cfg, &req, &mh, &kds, &mut dest, &join);
        assert!(matches!(res, Err(JoinError::Corruption(_))));
        assert_eq!(dest.usage(), 0);
    }
}
