//! Duplicate resolution for samples of one series
//!
//! Two samples with the same timestamp collapse into one: the greater value
//! wins, and NaN loses against any non-NaN value. The rule is commutative
//! and associative, so flush, merge and search agree regardless of the
//! order in which parts are combined.
//!
//! With a dedup interval, only the last sample of every
//! `(k * interval, (k + 1) * interval]` window is kept.

use crate::Timestamp;
use std::cmp::Ordering;

/// Whether `candidate` replaces `current` for the same timestamp
#[inline]
pub fn prefer(current: f64, candidate: f64) -> bool {
    if candidate.is_nan() {
        return false;
    }
    current.is_nan() || candidate.total_cmp(&current) == Ordering::Greater
}

/// The surviving value of two samples with the same timestamp
#[inline]
pub fn resolve(current: f64, candidate: f64) -> f64 {
    if prefer(current, candidate) {
        candidate
    } else {
        current
    }
}

/// Collapse duplicate timestamps of an already sorted column pair
pub fn dedup_sorted(timestamps: &mut Vec<Timestamp>, values: &mut Vec<f64>) {
    debug_assert_eq!(timestamps.len(), values.len());
    if timestamps.windows(2).all(|w| w[0] != w[1]) {
        return;
    }

    let mut write = 0;
    for read in 1..timestamps.len() {
        if timestamps[read] == timestamps[write] {
            values[write] = resolve(values[write], values[read]);
        } else {
            write += 1;
            timestamps[write] = timestamps[read];
            values[write] = values[read];
        }
    }
    timestamps.truncate(write + 1);
    values.truncate(write + 1);
}

/// Sort by timestamp, then collapse duplicates
pub fn sort_and_dedup(timestamps: &mut Vec<Timestamp>, values: &mut Vec<f64>) {
    if !timestamps.windows(2).all(|w| w[0] <= w[1]) {
        let mut pairs: Vec<(Timestamp, f64)> =
            timestamps.iter().copied().zip(values.iter().copied()).collect();
        pairs.sort_unstable_by_key(|(ts, _)| *ts);
        timestamps.clear();
        values.clear();
        for (ts, v) in pairs {
            timestamps.push(ts);
            values.push(v);
        }
    }
    dedup_sorted(timestamps, values);
}

/// Window a timestamp falls in: `(k * interval, (k + 1) * interval]` -> k
#[inline]
fn window_of(ts: Timestamp, interval: i64) -> i64 {
    ts.saturating_sub(1).div_euclid(interval)
}

/// Keep the last sample of each dedup window; columns must be sorted and
/// free of duplicate timestamps. A non-positive interval disables it.
pub fn dedup_interval(timestamps: &mut Vec<Timestamp>, values: &mut Vec<f64>, interval: i64) {
    if interval <= 0 || timestamps.len() < 2 {
        return;
    }

    let mut write = 0;
    for read in 1..timestamps.len() {
        if window_of(timestamps[read], interval) != window_of(timestamps[write], interval) {
            write += 1;
        }
        timestamps[write] = timestamps[read];
        values[write] = values[read];
    }
    timestamps.truncate(write + 1);
    values.truncate(write + 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(ts: &[i64], vals: &[f64]) -> (Vec<i64>, Vec<f64>) {
        let (mut ts, mut vals) = (ts.to_vec(), vals.to_vec());
        sort_and_dedup(&mut ts, &mut vals);
        (ts, vals)
    }

    #[test]
    fn test_identical_timestamps_keep_max() {
        assert_eq!(run(&[1000, 1000], &[2.0, 1.0]), (vec![1000], vec![2.0]));
        assert_eq!(
            run(&[1000, 1001, 1001, 1001, 2001], &[1.0, 2.0, 5.0, 3.0, 0.0]),
            (vec![1000, 1001, 2001], vec![1.0, 5.0, 0.0])
        );
    }

    #[test]
    fn test_nan_is_not_preferred() {
        assert_eq!(run(&[1000, 1000], &[2.0, f64::NAN]), (vec![1000], vec![2.0]));
        assert_eq!(run(&[1000, 1000], &[f64::NAN, 2.0]), (vec![1000], vec![2.0]));
        assert_eq!(
            run(&[1000, 1000, 1000], &[f64::INFINITY, f64::NAN, f64::NEG_INFINITY]),
            (vec![1000], vec![f64::INFINITY])
        );

        let (ts, vals) = run(&[1000, 1000, 2000, 2000], &[f64::NAN, f64::NAN, 2.0, 3.0]);
        assert_eq!(ts, vec![1000, 2000]);
        assert!(vals[0].is_nan());
        assert_eq!(vals[1], 3.0);
    }

    #[test]
    fn test_resolution_is_order_independent() {
        let values = [1.5, f64::NAN, -0.0, 0.0, 7.25, f64::NEG_INFINITY];
        for &a in &values {
            for &b in &values {
                assert_eq!(resolve(a, b).to_bits(), resolve(b, a).to_bits(), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_unsorted_input() {
        assert_eq!(
            run(&[30, 10, 20, 10], &[3.0, 1.0, 2.0, 4.0]),
            (vec![10, 20, 30], vec![4.0, 2.0, 3.0])
        );
    }

    #[test]
    fn test_dedup_interval_windows() {
        let mut ts = vec![0, 100, 101, 150, 180, 205, 300, 1000];
        let mut vals: Vec<f64> = (0..ts.len()).map(|i| i as f64).collect();
        dedup_interval(&mut ts, &mut vals, 100);
        assert_eq!(ts, vec![0, 100, 180, 300, 1000]);
        assert_eq!(vals, vec![0.0, 1.0, 4.0, 6.0, 7.0]);

        let mut ts = vec![10_000, 13_000, 21_000, 22_000, 30_000, 33_000, 39_000, 45_000];
        let mut vals: Vec<f64> = (0..ts.len()).map(|i| i as f64).collect();
        dedup_interval(&mut ts, &mut vals, 10_000);
        assert_eq!(ts, vec![10_000, 13_000, 30_000, 39_000, 45_000]);
        assert_eq!(vals, vec![0.0, 1.0, 4.0, 6.0, 7.0]);
    }

    #[test]
    fn test_dedup_interval_disabled() {
        let mut ts = vec![1, 2, 3];
        let mut vals = vec![1.0, 2.0, 3.0];
        dedup_interval(&mut ts, &mut vals, 0);
        assert_eq!(ts, vec![1, 2, 3]);
    }
}
