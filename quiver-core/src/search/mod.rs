//! Search executor
//!
//! A search resolves matchers to series IDs, snapshots the live MemParts
//! and parts, and then lazily streams each series' samples in time order,
//! merging across every source. The snapshot holds `Arc`s to its parts, so
//! merges that commit mid-scan never invalidate it; dropping the iterator
//! (or exhausting it, or hitting an error) releases them.

use crate::mempart::{MemPart, SeriesColumns};
use crate::merge::{dedup, merge_runs};
use crate::part::PartHandle;
use crate::{QuiverError, Result, Sample, SeriesId, TimeRange, Timestamp};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Limits of one search
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Fail with `DeadlineExceeded` once this instant has passed
    pub deadline: Option<Instant>,
    /// Fail with `Cancelled` once this token is cancelled
    pub cancel: Option<CancellationToken>,
    /// Fail with `TooManySeries` if the matchers select more series;
    /// defaults to the engine's `max_series_per_search`
    pub max_series: Option<usize>,
}

impl SearchOptions {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_max_series(mut self, max_series: usize) -> Self {
        self.max_series = Some(max_series);
        self
    }

    /// Error if the search should stop now
    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().map_or(false, |c| c.is_cancelled()) {
            return Err(QuiverError::Cancelled);
        }
        if self.deadline.map_or(false, |d| Instant::now() >= d) {
            return Err(QuiverError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Samples of the current series not yet handed out
struct Pending {
    series_id: SeriesId,
    timestamps: Vec<Timestamp>,
    values: Vec<f64>,
    pos: usize,
}

/// Lazy, single-pass stream of `(series, timestamp, value)` samples
///
/// Series come in ascending ID order; within a series timestamps are
/// strictly ascending. After an error the iterator is exhausted.
pub struct SearchIter {
    series: std::vec::IntoIter<SeriesId>,
    memparts: Vec<Arc<MemPart>>,
    parts: Vec<Arc<PartHandle>>,
    range: TimeRange,
    dedup_interval: i64,
    options: SearchOptions,
    pending: Option<Pending>,
    finished: bool,
}

impl SearchIter {
    pub(crate) fn new(
        series: Vec<SeriesId>,
        memparts: Vec<Arc<MemPart>>,
        parts: Vec<Arc<PartHandle>>,
        range: TimeRange,
        dedup_interval: i64,
        options: SearchOptions,
    ) -> Self {
        debug!(
            "Search over {} series, {} memparts, {} parts",
            series.len(),
            memparts.len(),
            parts.len()
        );
        Self {
            series: series.into_iter(),
            memparts,
            parts,
            range,
            dedup_interval,
            options,
            pending: None,
            finished: false,
        }
    }

    /// An iterator that yields nothing
    pub(crate) fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new(), TimeRange::all(), 0, SearchOptions::default())
    }

    /// Series not yet started
    pub fn remaining_series(&self) -> usize {
        self.series.len()
    }

    /// Parts still referenced by this scan
    pub fn parts_held(&self) -> usize {
        self.parts.len()
    }

    /// Collect the rest of the current series and the next one as columns,
    /// skipping per-sample iteration
    pub fn next_series(&mut self) -> Option<Result<SeriesColumns>> {
        if let Some(pending) = self.pending.take() {
            if pending.pos < pending.timestamps.len() {
                return Some(Ok(SeriesColumns {
                    series_id: pending.series_id,
                    timestamps: pending.timestamps[pending.pos..].to_vec(),
                    values: pending.values[pending.pos..].to_vec(),
                }));
            }
        }
        match self.advance()? {
            Ok(pending) => Some(Ok(SeriesColumns {
                series_id: pending.series_id,
                timestamps: pending.timestamps,
                values: pending.values,
            })),
            Err(e) => Some(Err(e)),
        }
    }

    /// Load the next series with at least one sample in range
    fn advance(&mut self) -> Option<Result<Pending>> {
        if self.finished {
            return None;
        }
        loop {
            let Some(series_id) = self.series.next() else {
                self.finish();
                return None;
            };
            if let Err(e) = self.options.check() {
                self.finish();
                return Some(Err(e));
            }
            match self.load(series_id) {
                Ok(Some(pending)) => return Some(Ok(pending)),
                Ok(None) => continue,
                Err(e) => {
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
    }

    fn load(&self, series_id: SeriesId) -> Result<Option<Pending>> {
        let mut runs = Vec::new();
        for mempart in &self.memparts {
            if let Some(run) = mempart.series_samples(series_id, &self.range) {
                runs.push(run);
            }
        }
        for part in &self.parts {
            if !part.contains_series(series_id) {
                continue;
            }
            match part.read_series(series_id, &self.range) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) | Err(QuiverError::PartQuarantined(_)) => {}
                Err(e) => {
                    if e.is_corruption() {
                        part.quarantine(&e);
                    }
                    return Err(e);
                }
            }
        }

        let (mut timestamps, mut values) = merge_runs(runs);
        dedup::dedup_interval(&mut timestamps, &mut values, self.dedup_interval);
        if timestamps.is_empty() {
            return Ok(None);
        }
        Ok(Some(Pending {
            series_id,
            timestamps,
            values,
            pos: 0,
        }))
    }

    /// Drop every held reference
    fn finish(&mut self) {
        self.finished = true;
        self.pending = None;
        self.memparts.clear();
        self.parts.clear();
    }
}

impl Iterator for SearchIter {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pending) = &mut self.pending {
                if pending.pos < pending.timestamps.len() {
                    let sample = Sample::new(
                        pending.series_id,
                        pending.timestamps[pending.pos],
                        pending.values[pending.pos],
                    );
                    pending.pos += 1;
                    return Some(Ok(sample));
                }
                self.pending = None;
            }

            match self.advance()? {
                Ok(pending) => self.pending = Some(pending),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl std::iter::FusedIterator for SearchIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempart::OutOfOrderPolicy;
    use crate::part::{part_path, PartConfig, PartWriter};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn part(dir: &Path, id: u64, series: &[(u64, Vec<i64>, Vec<f64>)]) -> Arc<PartHandle> {
        let mut writer = PartWriter::create(&dir.join("tmp"), id, 0, PartConfig::default()).unwrap();
        for (sid, ts, vals) in series {
            writer.add_series(*sid, ts, vals).unwrap();
        }
        writer.finish(&dir.join("parts")).unwrap();
        Arc::new(PartHandle::open(&part_path(&dir.join("parts"), id), id, &dir.join("quarantine")).unwrap())
    }

    fn collect(iter: SearchIter) -> Vec<(u64, i64, f64)> {
        iter.map(|s| s.unwrap())
            .map(|s| (s.series_id, s.timestamp, s.value))
            .collect()
    }

    #[test]
    fn test_merges_memparts_and_parts() {
        let dir = TempDir::new().unwrap();
        let p = part(dir.path(), 1, &[(1, vec![100, 200], vec![1.0, 2.0]), (2, vec![150], vec![9.0])]);
        let mem = Arc::new(MemPart::new(1, OutOfOrderPolicy::Accept));
        mem.append(1, 300, 3.0).unwrap();
        mem.append(1, 200, 7.0).unwrap();

        let iter = SearchIter::new(
            vec![1, 2, 3],
            vec![mem],
            vec![p],
            TimeRange::new(0, 1000),
            0,
            SearchOptions::default(),
        );
        assert_eq!(
            collect(iter),
            vec![(1, 100, 1.0), (1, 200, 7.0), (1, 300, 3.0), (2, 150, 9.0)]
        );
    }

    #[test]
    fn test_range_and_next_series() {
        let dir = TempDir::new().unwrap();
        let p = part(dir.path(), 1, &[(1, vec![100, 200, 300], vec![1.0, 2.0, 3.0]), (2, vec![250], vec![5.0])]);

        let mut iter = SearchIter::new(
            vec![1, 2],
            Vec::new(),
            vec![p],
            TimeRange::new(100, 260),
            0,
            SearchOptions::default(),
        );
        let first = iter.next().unwrap().unwrap();
        assert_eq!((first.series_id, first.timestamp), (1, 100));

        let rest = iter.next_series().unwrap().unwrap();
        assert_eq!(rest.series_id, 1);
        assert_eq!(rest.timestamps, vec![200]);
        assert_eq!(rest.values, vec![2.0]);

        let second = iter.next_series().unwrap().unwrap();
        assert_eq!((second.series_id, second.timestamps.clone()), (2, vec![250]));
        assert!(iter.next_series().is_none());
        assert_eq!(iter.parts_held(), 0);
    }

    #[test]
    fn test_cancel_releases_parts() {
        let dir = TempDir::new().unwrap();
        let p = part(dir.path(), 1, &[(1, vec![1], vec![1.0]), (2, vec![2], vec![2.0])]);
        let cancel = CancellationToken::new();

        let mut iter = SearchIter::new(
            vec![1, 2],
            Vec::new(),
            vec![p.clone()],
            TimeRange::all(),
            0,
            SearchOptions::default().with_cancel(cancel.clone()),
        );
        assert!(iter.next().unwrap().is_ok());
        assert_eq!(Arc::strong_count(&p), 2);

        cancel.cancel();
        assert!(matches!(iter.next(), Some(Err(QuiverError::Cancelled))));
        assert!(iter.next().is_none());
        assert_eq!(Arc::strong_count(&p), 1);
    }

    #[test]
    fn test_deadline() {
        let options = SearchOptions::default().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(options.check(), Err(QuiverError::DeadlineExceeded)));

        let mut iter = SearchIter::new(vec![1], Vec::new(), Vec::new(), TimeRange::all(), 0, options);
        assert!(matches!(iter.next(), Some(Err(QuiverError::DeadlineExceeded))));
        assert!(SearchIter::empty().next().is_none());
    }

    #[test]
    fn test_corrupt_part_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let p = part(dir.path(), 1, &[(1, (0..100).collect(), vec![1.5; 100])]);
        let path = part_path(&dir.path().join("parts"), 1);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[40] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut iter = SearchIter::new(vec![1], Vec::new(), vec![p.clone()], TimeRange::all(), 0, SearchOptions::default());
        let err = iter.next().unwrap().unwrap_err();
        assert!(err.is_corruption());
        assert!(p.is_quarantined());
    }
}
