//! Projection of join results into a tuple-slot store.
//!
//! One lane per combination. Every source attribute is offered to
//! [`JoinStrategy::project_datum`], which decides where in the destination
//! row it lands. No reservation is needed since row `gid` is the lane's own.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::data_store::{DataStore, SlotParts, StoreFormat};
use crate::device::{LaunchConfig, WorkGroup, launch, writeback_error_status};
use crate::error::{ErrorCode, JoinError, LayoutError, Result};
use crate::multihash::MultiHashTable;
use crate::request::{HashJoinRequest, ResultHeader};
use crate::strategy::{JoinStrategy, KernelContext, SlotDatum, SlotRow};

fn project_combination<S: JoinStrategy>(
    ctx: &KernelContext<'_>,
    strategy: &S,
    combination: &[i32],
    row: &mut SlotRow<'_>,
    errcode: &mut ErrorCode,
) -> Result<(), LayoutError> {
    for depth in 0..combination.len() {
        let colmeta = ctx.colmeta(depth)?;
        let Some(src) = ctx.source_tuple(combination, depth)? else {
            for colidx in 0..colmeta.len() {
                strategy.project_datum(row, depth, colidx, None, errcode);
            }
            continue;
        };
        let bytes = src.tuple.as_bytes();
        for (colidx, attr) in src.tuple.attributes(colmeta).enumerate() {
            let datum = attr?.map(|range| SlotDatum {
                cmeta: colmeta[colidx],
                hostaddr: src.hostaddr + range.start as u64,
                bytes: &bytes[range],
            });
            strategy.project_datum(row, depth, colidx, datum, errcode);
        }
    }
    Ok(())
}

fn run_group<S: JoinStrategy>(
    wg: &WorkGroup,
    ctx: &KernelContext<'_>,
    strategy: &S,
    header: &ResultHeader,
    results: &[i32],
    nitems: usize,
    dest: &SlotParts<'_>,
) {
    let nrels = header.nrels() as usize;
    let mut codes = vec![ErrorCode::Success; wg.local_size];

    for lane in wg.lanes() {
        let gid = wg.global_id(lane);
        if gid >= nitems {
            continue;
        }
        let combination = &results[gid * nrels..(gid + 1) * nrels];
        let start = gid * dest.ncols;
        // SAFETY: destination row `gid` belongs to this lane alone.
        let slices = unsafe {
            dest.values.slice_mut(start, dest.ncols).and_then(|values| {
                let isnull = dest.isnull.slice_mut(start, dest.ncols)?;
                Ok((values, isnull))
            })
        };
        let Ok((values, isnull)) = slices else {
            codes[lane].set(ErrorCode::DataStoreCorruption);
            continue;
        };
        let mut row = SlotRow { values, isnull };
        let mut code = ErrorCode::Success;
        if project_combination(ctx, strategy, combination, &mut row, &mut code).is_err() {
            code.set(ErrorCode::DataStoreCorruption);
        }
        codes[lane].set(code);
    }

    writeback_error_status(header.errcode_cell(), &codes);
}

/// Fill one row of the tuple-slot store `kds_dest` per combination in the
/// result buffer of `request`. Fixed-width values of up to 8 bytes are
/// stored by value; everything else as the host address of the datum.
/// Returns the number of rows.
pub fn gpuhashjoin_projection_slot<S: JoinStrategy>(
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

    if !kds.format().is_row() || kds_dest.format() != StoreFormat::TupSlot {
        warn!(
            source = ?kds.format(),
            dest = ?kds_dest.format(),
            "slot projection needs a row source and a tuple-slot destination"
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
    if header.nrels() as usize != ctx.ntables() + 1 {
        warn!(
            nrels = header.nrels(),
            ntables = ctx.ntables(),
            "result width does not match the hash tables"
        );
        writeback_error_status(errcode, &[ErrorCode::DataStoreCorruption]);
        return header.status();
    }
    let dest = match kds_dest.slot_parts() {
        Ok(dest) => dest,
        Err(e) => {
            warn!(error = %e, "malformed destination store");
            writeback_error_status(errcode, &[ErrorCode::DataStoreCorruption]);
            return header.status();
        }
    };

    debug!(nitems, ncols = dest.ncols, "gpuhashjoin_projection_slot");
    dest.nitems.store(nitems, Ordering::Release);
    let results = result.raw_results();
    let nitems = nitems as usize;
    launch(config, nitems, |wg| {
        run_group(wg, &ctx, strategy, header, results, nitems, &dest)
    });

    if header.errcode() == ErrorCode::DataStoreCorruption {
        warn!("slot projection reported corruption");
    }
    header.status()
}
