//! MemPart - the in-memory ingestion buffer
//!
//! Samples are appended into per-series column buffers held in a lock-free
//! skip list keyed by series ID. Each buffer has its own small mutex, so
//! writers to different series never contend. Buffers tolerate bounded
//! out-of-order arrival and are sorted and de-duplicated when read.

use crate::merge::dedup;
use crate::{QuiverError, Result, SeriesId, TimeRange, Timestamp};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Approximate in-memory cost of one buffered sample
const SAMPLE_BYTES: usize = 16;
/// Approximate fixed cost of one series buffer
const SERIES_OVERHEAD_BYTES: usize = 96;

/// What to do with a sample older than its series' newest buffered sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutOfOrderPolicy {
    /// Reject samples more than `tolerance_ms` behind; accept the rest
    Reject { tolerance_ms: i64 },
    /// Accept every sample
    Accept,
}

impl Default for OutOfOrderPolicy {
    fn default() -> Self {
        OutOfOrderPolicy::Reject {
            tolerance_ms: crate::config::OUT_OF_ORDER_TOLERANCE_MS,
        }
    }
}

/// MemPart configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemPartConfig {
    /// Flush once this many rows are buffered
    pub max_rows: usize,
    /// Flush once the buffer holds roughly this many bytes
    pub max_bytes: usize,
    /// Flush once the buffer is this old
    pub max_age: Duration,
    /// Out-of-order handling
    pub out_of_order: OutOfOrderPolicy,
}

impl Default for MemPartConfig {
    fn default() -> Self {
        Self {
            max_rows: crate::config::MEMPART_MAX_ROWS,
            max_bytes: crate::config::MEMPART_MAX_BYTES,
            max_age: crate::config::MEMPART_MAX_AGE,
            out_of_order: OutOfOrderPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct SeriesBuffer {
    timestamps: Vec<Timestamp>,
    values: Vec<f64>,
    max_ts: Option<Timestamp>,
    sorted: bool,
}

impl SeriesBuffer {
    fn new() -> Self {
        Self {
            sorted: true,
            ..Default::default()
        }
    }
}

/// Sorted, de-duplicated samples of one series
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesColumns {
    pub series_id: SeriesId,
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<f64>,
}

impl SeriesColumns {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// The mutable part-in-progress
pub struct MemPart {
    id: u64,
    series: SkipMap<SeriesId, Mutex<SeriesBuffer>>,
    rows: AtomicUsize,
    bytes: AtomicUsize,
    min_ts: AtomicI64,
    max_ts: AtomicI64,
    created_at: Instant,
    policy: OutOfOrderPolicy,
}

impl MemPart {
    /// Create an empty MemPart; `id` orders MemParts by creation
    pub fn new(id: u64, policy: OutOfOrderPolicy) -> Self {
        Self {
            id,
            series: SkipMap::new(),
            rows: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            min_ts: AtomicI64::new(Timestamp::MAX),
            max_ts: AtomicI64::new(Timestamp::MIN),
            created_at: Instant::now(),
            policy,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append one sample
    pub fn append(&self, series_id: SeriesId, timestamp: Timestamp, value: f64) -> Result<()> {
        let entry = self
            .series
            .get_or_insert(series_id, Mutex::new(SeriesBuffer::new()));
        let mut buf = entry.value().lock();

        let first = buf.timestamps.is_empty();
        if let Some(last) = buf.max_ts {
            if timestamp < last {
                if let OutOfOrderPolicy::Reject { tolerance_ms } = self.policy {
                    if last.saturating_sub(timestamp) > tolerance_ms {
                        return Err(QuiverError::OutOfOrder {
                            series_id,
                            timestamp,
                            last_timestamp: last,
                        });
                    }
                }
                buf.sorted = false;
            }
        }

        buf.timestamps.push(timestamp);
        buf.values.push(value);
        buf.max_ts = Some(buf.max_ts.map_or(timestamp, |m| m.max(timestamp)));
        drop(buf);

        let cost = SAMPLE_BYTES + if first { SERIES_OVERHEAD_BYTES } else { 0 };
        self.rows.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(cost, Ordering::Relaxed);
        self.min_ts.fetch_min(timestamp, Ordering::Relaxed);
        self.max_ts.fetch_max(timestamp, Ordering::Relaxed);
        Ok(())
    }

    /// Check whether any flush threshold has been crossed
    pub fn should_flush(&self, config: &MemPartConfig) -> bool {
        let rows = self.rows();
        rows > 0
            && (rows >= config.max_rows
                || self.size() >= config.max_bytes
                || self.age() >= config.max_age)
    }

    /// Buffered rows, counting duplicates
    pub fn rows(&self) -> usize {
        self.rows.load(Ordering::Relaxed)
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Time range of buffered samples
    pub fn time_range(&self) -> Option<TimeRange> {
        if self.is_empty() {
            return None;
        }
        Some(TimeRange::new(
            self.min_ts.load(Ordering::Relaxed),
            self.max_ts.load(Ordering::Relaxed),
        ))
    }

    pub fn contains_series(&self, series_id: SeriesId) -> bool {
        self.series.contains_key(&series_id)
    }

    /// Sorted, de-duplicated samples of one series within `range`
    pub fn series_samples(&self, series_id: SeriesId, range: &TimeRange) -> Option<SeriesColumns> {
        let entry = self.series.get(&series_id)?;
        let (mut timestamps, mut values) = {
            let buf = entry.value().lock();
            let mut ts = Vec::new();
            let mut vals = Vec::new();
            for (t, v) in buf.timestamps.iter().zip(&buf.values) {
                if range.contains(*t) {
                    ts.push(*t);
                    vals.push(*v);
                }
            }
            (ts, vals)
        };
        if timestamps.is_empty() {
            return None;
        }
        dedup::sort_and_dedup(&mut timestamps, &mut values);
        Some(SeriesColumns {
            series_id,
            timestamps,
            values,
        })
    }

    /// Every series in ID order, sorted and de-duplicated
    pub fn iter_series(&self) -> impl Iterator<Item = SeriesColumns> + '_ {
        self.series.iter().filter_map(|entry| {
            let (mut timestamps, mut values) = {
                let buf = entry.value().lock();
                (buf.timestamps.clone(), buf.values.clone())
            };
            if timestamps.is_empty() {
                return None;
            }
            dedup::sort_and_dedup(&mut timestamps, &mut values);
            Some(SeriesColumns {
                series_id: *entry.key(),
                timestamps,
                values,
            })
        })
    }

    /// IDs of series with buffered samples, ascending
    pub fn series_ids(&self) -> Vec<SeriesId> {
        self.series.iter().map(|e| *e.key()).collect()
    }

    /// Sort every unsorted buffer in place; called once the MemPart stops
    /// accepting writes so later reads skip the sort
    pub fn seal(&self) {
        for entry in self.series.iter() {
            let mut buf = entry.value().lock();
            if !buf.sorted {
                let SeriesBuffer {
                    timestamps, values, ..
                } = &mut *buf;
                dedup::sort_and_dedup(timestamps, values);
                buf.sorted = true;
            }
        }
    }
}
