//! Core types for QuiverDB

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Process-durable numeric identifier of a series
pub type SeriesId = u64;

/// Reserved label name holding the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single (name, value) label
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    /// Create a new label
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered label set identifying a series
///
/// Labels are kept sorted by name with at most one label per name, so two
/// label sets that differ only in insertion order compare and hash equal.
/// Labels with an empty value are dropped: an empty value is the same as
/// the label being absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a canonical label set; a later duplicate name overrides an earlier one
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut labels: Vec<Label> = labels.into_iter().filter(|l| !l.value.is_empty()).collect();
        // stable sort keeps insertion order among equal names
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out: Vec<Label> = Vec::with_capacity(labels.len());
        for label in labels {
            match out.last_mut() {
                Some(last) if last.name == label.name => *last = label,
                _ => out.push(label),
            }
        }
        Self(out)
    }

    /// Build from (name, value) pairs
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(n, v)| Label::new(n, v)))
    }

    /// Add a label, returning the new set
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push(Label::new(name, value));
        Self::new(self.0)
    }

    /// Value of the named label, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Metric name (`__name__` label)
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Approximate heap size in bytes
    pub fn size(&self) -> usize {
        self.0.iter().map(|l| l.name.len() + l.value.len()).sum()
    }

    /// Canonical string form, e.g. `{__name__="cpu",host="a"}`
    pub fn canonical(&self) -> String {
        let mut s = String::with_capacity(self.size() + self.0.len() * 4 + 2);
        s.push('{');
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            s.push_str(&l.name);
            s.push_str("=\"");
            s.push_str(&l.value);
            s.push('"');
        }
        s.push('}');
        s
    }

    /// Hash of the canonical form, used to pick a registry shard
    pub fn canonical_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A row as received from the ingestion front door
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub labels: Labels,
    pub timestamp: Timestamp,
    pub value: f64,
}

impl MetricRow {
    /// Create a new row
    pub fn new(labels: Labels, timestamp: Timestamp, value: f64) -> Self {
        Self {
            labels,
            timestamp,
            value,
        }
    }
}

/// A stored sample of one series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub series_id: SeriesId,
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Sample {
    pub fn new(series_id: SeriesId, timestamp: Timestamp, value: f64) -> Self {
        Self {
            series_id,
            timestamp,
            value,
        }
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering every representable timestamp
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Duration in milliseconds
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_canonical_order() {
        let a = Labels::from_pairs([("host", "a"), ("__name__", "cpu"), ("dc", "eu")]);
        let b = Labels::from_pairs([("dc", "eu"), ("host", "a"), ("__name__", "cpu")]);

        assert_eq!(a, b);
        assert_eq!(a.canonical_hash(), b.canonical_hash());
        assert_eq!(a.canonical(), r#"{__name__="cpu",dc="eu",host="a"}"#);
        assert_eq!(a.metric_name(), Some("cpu"));
    }

    #[test]
    fn test_labels_duplicates_and_empty_values() {
        let labels = Labels::from_pairs([("job", "x"), ("job", "y"), ("env", "")]);

        assert_eq!(labels.len(), 1);
        assert_eq!(labels.get("job"), Some("y"));
        assert_eq!(labels.get("env"), None);
    }

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(300, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(200));
        assert!(!range1.contains(250));
        assert!(TimeRange::new(5, 1).is_empty());
        assert_eq!(TimeRange::all().duration(), i64::MAX);
    }
}
