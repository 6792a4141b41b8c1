//! Per-day series index

use crate::{SeriesId, TimeRange, Timestamp};
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use std::collections::BTreeMap;

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Ranges spanning more days than this skip the per-day filter
pub const MAX_DAYS_FOR_PER_DAY_SEARCH: i64 = 40;

/// UTC day number of a timestamp
pub fn day_of(ts: Timestamp) -> i64 {
    ts.div_euclid(MS_PER_DAY)
}

/// Tracks which series received samples on each UTC day
///
/// A series whose samples span more days than a filtered search can cover
/// is kept in a separate set that every per-day lookup includes, so the
/// day map never grows with the width of a time span.
#[derive(Default)]
pub struct DayIndex {
    days: RwLock<BTreeMap<i64, RoaringTreemap>>,
    wide: RwLock<RoaringTreemap>,
}

impl DayIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` has data on the day of `ts`
    pub fn mark(&self, id: SeriesId, ts: Timestamp) {
        let day = day_of(ts);
        if self
            .days
            .read()
            .get(&day)
            .map_or(false, |bitmap| bitmap.contains(id))
        {
            return;
        }
        self.days.write().entry(day).or_default().insert(id);
    }

    /// Record that `id` has data somewhere in `[min_ts, max_ts]`
    pub fn mark_range(&self, id: SeriesId, min_ts: Timestamp, max_ts: Timestamp) {
        let (first, last) = (day_of(min_ts), day_of(max_ts));
        if last - first >= MAX_DAYS_FOR_PER_DAY_SEARCH {
            self.wide.write().insert(id);
            return;
        }
        let mut days = self.days.write();
        for day in first..=last {
            days.entry(day).or_default().insert(id);
        }
    }

    /// Series with data in `range`, or `None` when the range is too wide to filter
    pub fn series_in(&self, range: &TimeRange) -> Option<RoaringTreemap> {
        if range.is_empty() {
            return Some(RoaringTreemap::new());
        }
        let (first, last) = (day_of(range.start), day_of(range.end));
        if last - first >= MAX_DAYS_FOR_PER_DAY_SEARCH {
            return None;
        }

        let mut out = self.wide.read().clone();
        let days = self.days.read();
        for (_, bitmap) in days.range(first..=last) {
            out |= bitmap;
        }
        Some(out)
    }

    /// Forget `ids` on every day
    pub fn remove(&self, ids: &RoaringTreemap) {
        *self.wide.write() -= ids;
        let mut days = self.days.write();
        days.retain(|_, bitmap| {
            *bitmap -= ids;
            !bitmap.is_empty()
        });
    }

    /// Drop whole days that end before `cutoff`
    pub fn drop_before(&self, cutoff: Timestamp) {
        let first_kept = day_of(cutoff);
        let mut days = self.days.write();
        *days = days.split_off(&first_kept);
    }

    /// Number of days with at least one series
    pub fn len(&self) -> usize {
        self.days.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.read().is_empty() && self.wide.read().is_empty()
    }
}
