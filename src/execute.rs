//! The execution kernel: count matches per outer row, reserve result rooms
//! once per group, then emit the combinations.

use tracing::{debug, trace, warn};

use crate::data_store::DataStore;
use crate::device::{LaunchConfig, WorkGroup, launch, stairlike_add, writeback_error_status};
use crate::error::{ErrorCode, Result};
use crate::layout::SharedSlice;
use crate::multihash::MultiHashTable;
use crate::request::{HashJoinRequest, ResultHeader, RowMap};
use crate::strategy::{CombinationWriter, JoinStrategy, KernelContext, ProbeMode};

/// Structural checks done once per launch; every lane would reach the same
/// verdict.
fn check_inputs(header: &ResultHeader, ctx: &KernelContext<'_>) -> ErrorCode {
    if header.nrels() as usize != ctx.ntables() + 1 {
        warn!(
            nrels = header.nrels(),
            ntables = ctx.ntables(),
            "result buffer width does not match the hash tables"
        );
        return ErrorCode::DataStoreCorruption;
    }
    if !ctx.kds.format().is_row() {
        warn!(format = ?ctx.kds.format(), "outer store is not row-oriented");
        return ErrorCode::DataStoreCorruption;
    }
    if ctx.tables.iter().any(|t| t.is_outer()) {
        warn!("outer joins are not supported");
        return ErrorCode::DataStoreCorruption;
    }
    ErrorCode::Success
}

/// Outer row of worker `gid`, or `None` when the worker is out of range.
#[inline(always)]
fn select_row(row_map: Option<&RowMap>, nitems: usize, gid: usize) -> Option<usize> {
    let index = match row_map {
        None => gid,
        Some(map) => map.index(gid)?,
    };
    (index < nitems).then_some(index)
}

fn run_group<S: JoinStrategy>(
    wg: &WorkGroup,
    ctx: &KernelContext<'_>,
    strategy: &S,
    header: &ResultHeader,
    results: &SharedSlice<'_, i32>,
    row_map: Option<&RowMap>,
) {
    let nlanes = wg.local_size;
    let nrels = header.nrels() as usize;
    let nitems = ctx.kds.nitems() as usize;
    let mut codes = vec![ErrorCode::Success; nlanes];
    let mut rows = vec![None; nlanes];
    let mut counts = vec![0u32; nlanes];

    for lane in wg.lanes() {
        rows[lane] = select_row(row_map, nitems, wg.global_id(lane));
        if let Some(row) = rows[lane] {
            counts[lane] = strategy.probe(ctx, row, ProbeMode::Count, &mut codes[lane]);
        }
    }

    let mut offsets = vec![0u32; nlanes];
    let total = stairlike_add(&counts, &mut offsets);
    let base = if total > 0 { header.reserve(total) } else { 0 };
    trace!(group = wg.group_id, base, total, "reserved result rooms");

    if base as u64 + total as u64 > header.nrooms() as u64 {
        codes[0].set(ErrorCode::DataStoreNoSpace);
        writeback_error_status(header.errcode_cell(), &codes);
        return;
    }

    for lane in wg.lanes() {
        let (Some(row), n) = (rows[lane], counts[lane]) else {
            continue;
        };
        if n == 0 || codes[lane].is_aggregated() {
            continue;
        }
        let start = (base + offsets[lane]) as usize * nrels;
        // SAFETY: the group owns [base, base + total) and lanes own disjoint
        // sub-ranges of it by the exclusive scan.
        let slots = match unsafe { results.slice_mut(start, n as usize * nrels) } {
            Ok(slots) => slots,
            Err(_) => {
                codes[lane].set(ErrorCode::DataStoreCorruption);
                continue;
            }
        };
        let mut writer = CombinationWriter::new(slots, nrels);
        strategy.probe(ctx, row, ProbeMode::Emit(&mut writer), &mut codes[lane]);
        if writer.written() != n as usize {
            codes[lane].set(ErrorCode::DataStoreCorruption);
            continue;
        }
        if codes[lane] == ErrorCode::CpuReCheck {
            for combination in writer.into_slots().chunks_exact_mut(nrels) {
                combination[0] = -combination[0];
            }
            header.mark_rechecks();
        }
    }

    writeback_error_status(header.errcode_cell(), &codes);
}

/// Run the join of `kds` against every table in `mhash`, filling the result
/// buffer of `request`. Returns the combination count, or the error the
/// launch recorded.
pub fn gpuhashjoin_main<S: JoinStrategy>(
    config: &LaunchConfig,
    request: &mut HashJoinRequest,
    mhash: &MultiHashTable,
    kds: &DataStore,
    strategy: &S,
) -> Result<u32> {
    let (params, result, row_map) = request.parts_mut();
    let (header, results) = result.split_mut();

    let ctx = match mhash
        .view()
        .and_then(|view| KernelContext::new(params, view, kds))
    {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "malformed hash tables");
            writeback_error_status(header.errcode_cell(), &[ErrorCode::DataStoreCorruption]);
            return header.status();
        }
    };
    let code = check_inputs(header, &ctx);
    if !code.is_success() {
        writeback_error_status(header.errcode_cell(), &[code]);
        return header.status();
    }

    let global_size = row_map.map_or(kds.nitems() as usize, RowMap::nvalids);
    debug!(
        nrels = header.nrels(),
        nrooms = header.nrooms(),
        outer_rows = kds.nitems(),
        global_size,
        "gpuhashjoin_main"
    );
    let results = SharedSlice::new(results);
    launch(config, global_size, |wg| {
        run_group(wg, &ctx, strategy, header, &results, row_map)
    });

    match header.errcode() {
        ErrorCode::DataStoreNoSpace => warn!(
            nrooms = header.nrooms(),
            "result buffer too small, count and emit must be re-run"
        ),
        ErrorCode::DataStoreCorruption => warn!("join kernel reported corruption"),
        _ => {}
    }
    header.status()
}
