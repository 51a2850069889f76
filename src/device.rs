//! Data-parallel launch model on host threads.
//!
//! A launch covers `global_size` logical lanes rounded up to a whole number
//! of work-groups. Groups are claimed from a shared counter by a pool of
//! scoped worker threads and run to completion one at a time per thread.
//! Inside a group the kernel walks its lanes phase by phase, so the end of
//! one phase loop is the group barrier.

use std::ops::Range;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::thread;

use tracing::debug;

use crate::error::ErrorCode;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Lanes per work-group; a power of two.
    pub local_size: usize,
    /// Threads executing groups concurrently.
    pub workers: usize,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new(64)
    }
}

impl LaunchConfig {
    pub fn new(local_size: usize) -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(local_size, workers)
    }

    pub fn with_workers(local_size: usize, workers: usize) -> Self {
        debug_assert!(local_size.is_power_of_two(), "local_size must be a power of two");
        Self {
            local_size: local_size.max(1),
            workers: workers.max(1),
        }
    }

    #[inline(always)]
    pub fn num_groups(&self, global_size: usize) -> usize {
        global_size.div_ceil(self.local_size)
    }
}

/// One work-group of a launch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkGroup {
    pub group_id: usize,
    pub local_size: usize,
    /// Lanes in the whole grid, a multiple of `local_size`.
    pub global_size: usize,
}

impl WorkGroup {
    #[inline(always)]
    pub fn lanes(&self) -> Range<usize> {
        0..self.local_size
    }

    #[inline(always)]
    pub fn global_id(&self, lane: usize) -> usize {
        self.group_id * self.local_size + lane
    }

    #[inline(always)]
    pub fn global_ids(&self) -> Range<usize> {
        self.global_id(0)..self.global_id(self.local_size)
    }
}

/// Run `kernel` once per work-group covering `global_size` lanes.
pub fn launch<F>(config: &LaunchConfig, global_size: usize, kernel: F)
where
    F: Fn(&WorkGroup) + Sync,
{
    let ngroups = config.num_groups(global_size);
    if ngroups == 0 {
        return;
    }
    let local_size = config.local_size;
    let grid = ngroups * local_size;
    let workers = config.workers.min(ngroups);
    debug!(ngroups, local_size, workers, global_size = grid, "launch");

    let next_group = AtomicUsize::new(0);
    let run = || {
        loop {
            let group_id = next_group.fetch_add(1, Ordering::Relaxed);
            if group_id >= ngroups {
                break;
            }
            kernel(&WorkGroup {
                group_id,
                local_size,
                global_size: grid,
            });
        }
    };

    if workers == 1 {
        run();
        return;
    }
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(&run);
        }
    });
}

/// Exclusive prefix sum of the lanes' `values` into `offsets`; returns the
/// group total. Sums saturate at `u32::MAX`, which no capacity can hold.
pub fn stairlike_add(values: &[u32], offsets: &mut [u32]) -> u32 {
    debug_assert_eq!(values.len(), offsets.len());
    let mut total = 0u32;
    for (v, off) in values.iter().zip(offsets.iter_mut()) {
        *off = total;
        total = total.saturating_add(*v);
    }
    total
}

/// Code a group reports: the first lane error that is aggregated.
pub fn group_error(lane_codes: &[ErrorCode]) -> ErrorCode {
    lane_codes
        .iter()
        .copied()
        .find(|c| c.is_aggregated())
        .unwrap_or(ErrorCode::Success)
}

/// Merge a group's lane codes into the shared status; an error already
/// recorded is never overwritten. Returns the code left in `errcode`.
pub fn writeback_error_status(errcode: &AtomicI32, lane_codes: &[ErrorCode]) -> ErrorCode {
    let code = group_error(lane_codes);
    if code.is_success() {
        return ErrorCode::from_code(errcode.load(Ordering::Acquire));
    }
    match errcode.compare_exchange(
        ErrorCode::Success.code(),
        code.code(),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => code,
        Err(prev) => ErrorCode::from_code(prev),
    }
}
