//! K-way merge of parts

use super::dedup;
use crate::mempart::SeriesColumns;
use crate::part::{PartHandle, PartWriter};
use crate::{QuiverError, Result, TimeRange, Timestamp};
use roaring::RoaringTreemap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Merge sorted, duplicate-free runs of one series into a single run
///
/// Equal timestamps from different runs collapse through
/// [`dedup::resolve`], so the result does not depend on run order.
pub fn merge_runs(mut runs: Vec<SeriesColumns>) -> (Vec<Timestamp>, Vec<f64>) {
    runs.retain(|r| !r.is_empty());
    match runs.len() {
        0 => return (Vec::new(), Vec::new()),
        1 => {
            let run = runs.remove(0);
            return (run.timestamps, run.values);
        }
        _ => {}
    }

    let total: usize = runs.iter().map(|r| r.len()).sum();
    let mut timestamps = Vec::with_capacity(total);
    let mut values: Vec<f64> = Vec::with_capacity(total);

    let mut positions = vec![0usize; runs.len()];
    let mut heap: BinaryHeap<Reverse<(Timestamp, usize)>> = runs
        .iter()
        .enumerate()
        .map(|(i, r)| Reverse((r.timestamps[0], i)))
        .collect();

    while let Some(Reverse((ts, run))) = heap.pop() {
        let value = runs[run].values[positions[run]];
        match timestamps.last() {
            Some(&last) if last == ts => {
                let slot = values.len() - 1;
                values[slot] = dedup::resolve(values[slot], value);
            }
            _ => {
                timestamps.push(ts);
                values.push(value);
            }
        }

        positions[run] += 1;
        if let Some(&next) = runs[run].timestamps.get(positions[run]) {
            heap.push(Reverse((next, run)));
        }
    }

    (timestamps, values)
}

/// Drop samples older than `cutoff` from sorted columns
pub fn apply_cutoff(timestamps: &mut Vec<Timestamp>, values: &mut Vec<f64>, cutoff: Timestamp) {
    let keep_from = timestamps.partition_point(|&ts| ts < cutoff);
    if keep_from > 0 {
        timestamps.drain(..keep_from);
        values.drain(..keep_from);
    }
}

/// Row filters applied while merging
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Drop samples older than this
    pub retention_cutoff: Option<Timestamp>,
    /// Keep one sample per window of this many milliseconds; 0 disables
    pub dedup_interval: i64,
    /// Abort between series once cancelled
    pub cancel: Option<CancellationToken>,
}

/// Row counts of a finished merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub rows_in: u64,
    pub rows_out: u64,
}

/// Merges a fixed set of input parts into one writer
pub struct Merger<'a> {
    inputs: &'a [Arc<PartHandle>],
    options: MergeOptions,
}

impl<'a> Merger<'a> {
    pub fn new(inputs: &'a [Arc<PartHandle>], options: MergeOptions) -> Self {
        Self { inputs, options }
    }

    /// Stream every series of every input, in ascending series order,
    /// into `writer`
    pub fn run(&self, writer: &mut PartWriter) -> Result<MergeOutcome> {
        let mut series = RoaringTreemap::new();
        let mut rows_in = 0;
        for part in self.inputs {
            series |= part.series_ids();
            rows_in += part.meta().rows;
        }

        let all = TimeRange::all();
        for series_id in series.iter() {
            if self.options.cancel.as_ref().map_or(false, |c| c.is_cancelled()) {
                return Err(QuiverError::Cancelled);
            }

            let mut runs = Vec::with_capacity(self.inputs.len());
            for part in self.inputs.iter().filter(|p| p.contains_series(series_id)) {
                if let Some(run) = part.read_series(series_id, &all)? {
                    runs.push(run);
                }
            }

            let (mut timestamps, mut values) = merge_runs(runs);
            if let Some(cutoff) = self.options.retention_cutoff {
                apply_cutoff(&mut timestamps, &mut values, cutoff);
            }
            dedup::dedup_interval(&mut timestamps, &mut values, self.options.dedup_interval);
            writer.add_series(series_id, &timestamps, &values)?;
        }

        Ok(MergeOutcome {
            rows_in,
            rows_out: writer.rows(),
        })
    }
}
