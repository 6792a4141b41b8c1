//! Label index (IndexDB)
//!
//! Maps label sets to stable series IDs and back, and resolves label
//! matchers to series:
//!
//! - **Registry**: labels -> ID and ID -> labels, sharded by hash
//! - **Postings**: (name, value) -> series bitmap, sharded by label name
//! - **Day index**: UTC day -> series with samples that day
//! - **Series log**: durable record of every creation and removal

mod days;
mod matcher;
mod postings;
mod series_log;

pub use days::{day_of, DayIndex, MAX_DAYS_FOR_PER_DAY_SEARCH, MS_PER_DAY};
pub use matcher::{MatchOp, Matcher};
pub use postings::Postings;
pub use series_log::{Replay, SeriesLog, SeriesRecord, SERIES_LOG_FILE};

use crate::{Labels, QuiverError, Result, SeriesId, TimeRange, Timestamp};
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Series log sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N records
    EveryN(usize),
    /// Sync on interval
    Interval { millis: u64 },
    /// Never sync explicitly; part flushes still sync the log first
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// Index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Lock shards for the registry and postings
    pub shards: usize,
    /// Series log sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            shards: crate::config::INDEX_SHARDS,
            sync_policy: SyncPolicy::default(),
        }
    }
}

type ForwardShard = RwLock<HashMap<Arc<Labels>, SeriesId>>;
type ReverseShard = RwLock<HashMap<SeriesId, Arc<Labels>>>;

/// The label index
pub struct IndexDb {
    dir: PathBuf,
    forward: Vec<ForwardShard>,
    reverse: Vec<ReverseShard>,
    postings: Postings,
    days: DayIndex,
    all: RwLock<RoaringTreemap>,
    next_id: AtomicU64,
    log: SeriesLog,
}

impl IndexDb {
    /// Open the index stored in `dir`, replaying its series log
    pub fn open(dir: impl Into<PathBuf>, config: &IndexConfig) -> Result<Self> {
        let dir = dir.into();
        let shards = config.shards.max(1);
        let (log, replay) = SeriesLog::open(&dir, config.sync_policy)?;

        let index = Self {
            dir,
            forward: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            reverse: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            postings: Postings::new(shards),
            days: DayIndex::new(),
            all: RwLock::new(RoaringTreemap::new()),
            next_id: AtomicU64::new(replay.next_id.max(1)),
            log,
        };

        for (id, labels) in replay.series {
            let labels = Arc::new(labels);
            let previous = index
                .forward_shard(&labels)
                .write()
                .insert(labels.clone(), id);
            if let Some(other) = previous {
                return Err(QuiverError::IndexCorruption(format!(
                    "label set {} assigned to both series {} and {}",
                    labels, other, id
                )));
            }
            index.postings.insert(&labels, id);
            index.reverse_shard(id).write().insert(id, labels);
            index.all.write().insert(id);
        }

        info!(
            "Opened index at {:?}: {} series",
            index.dir,
            index.series_count()
        );
        Ok(index)
    }

    fn forward_shard(&self, labels: &Labels) -> &ForwardShard {
        &self.forward[(labels.canonical_hash() % self.forward.len() as u64) as usize]
    }

    fn reverse_shard(&self, id: SeriesId) -> &ReverseShard {
        &self.reverse[(id % self.reverse.len() as u64) as usize]
    }

    /// Look up the ID of a label set without creating it
    pub fn series_id(&self, labels: &Labels) -> Option<SeriesId> {
        self.forward_shard(labels).read().get(labels).copied()
    }

    /// Return the ID of `labels`, creating the series on first sight
    ///
    /// Creation happens under the write lock of the label set's registry
    /// shard with a re-check, so concurrent callers with the same labels
    /// always observe a single ID.
    pub fn get_or_create_series_id(&self, labels: &Labels) -> Result<SeriesId> {
        if labels.is_empty() {
            return Err(QuiverError::InvalidSample("empty label set".into()));
        }

        let shard = self.forward_shard(labels);
        if let Some(id) = shard.read().get(labels) {
            return Ok(*id);
        }

        let mut forward = shard.write();
        if let Some(id) = forward.get(labels) {
            return Ok(*id);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.log.append(&[SeriesRecord::Create {
            id,
            labels: labels.clone(),
        }])?;

        let labels = Arc::new(labels.clone());
        self.reverse_shard(id).write().insert(id, labels.clone());
        self.postings.insert(&labels, id);
        self.all.write().insert(id);
        forward.insert(labels, id);

        debug!("Created series {}", id);
        Ok(id)
    }

    /// Resolve a batch of label sets, taking each shard lock once per distinct label set
    pub fn get_or_create_batch<'a>(
        &self,
        batch: impl IntoIterator<Item = &'a Labels>,
    ) -> Result<Vec<SeriesId>> {
        let mut seen: HashMap<&'a Labels, SeriesId> = HashMap::new();
        let mut out = Vec::new();
        for labels in batch {
            let id = match seen.get(labels) {
                Some(id) => *id,
                None => {
                    let id = self.get_or_create_series_id(labels)?;
                    seen.insert(labels, id);
                    id
                }
            };
            out.push(id);
        }
        Ok(out)
    }

    /// Reverse lookup
    pub fn labels(&self, id: SeriesId) -> Option<Labels> {
        self.labels_ref(id).map(|l| (*l).clone())
    }

    fn labels_ref(&self, id: SeriesId) -> Option<Arc<Labels>> {
        self.reverse_shard(id).read().get(&id).cloned()
    }

    /// Record that `id` received a sample at `ts`
    pub fn mark_day(&self, id: SeriesId, ts: Timestamp) {
        self.days.mark(id, ts);
    }

    /// Record that `id` has samples spanning `[min_ts, max_ts]`
    pub fn mark_days(&self, id: SeriesId, min_ts: Timestamp, max_ts: Timestamp) {
        self.days.mark_range(id, min_ts, max_ts);
    }

    /// Resolve matchers to the series they select within `range`
    ///
    /// Matchers that need the label present are answered from postings and
    /// intersected smallest-first. Negated exact matches and literal
    /// alternations are subtracted as postings. Remaining regex matchers are
    /// evaluated against each candidate's labels. A selector with no
    /// label-requiring matcher starts from the set of all series.
    pub fn resolve_matchers(&self, matchers: &[Matcher], range: &TimeRange) -> Result<RoaringTreemap> {
        if matchers.is_empty() {
            return Err(QuiverError::InvalidMatcher("empty selector".into()));
        }

        let has_exact_positive = matchers
            .iter()
            .any(|m| m.requires_label() && m.op == MatchOp::Equal);

        let mut positive: Vec<RoaringTreemap> = Vec::new();
        let mut negative: Vec<RoaringTreemap> = Vec::new();
        let mut filters: Vec<&Matcher> = Vec::new();

        for m in matchers {
            match (m.op, m.requires_label()) {
                (MatchOp::Equal, true) => positive.push(self.postings.get(&m.name, &m.value)),
                // name!=""
                (MatchOp::NotEqual, true) => positive.push(self.postings.with_name(&m.name)),
                (MatchOp::Regex, true) => match m.literals() {
                    Some(literals) => positive.push(self.postings.union_of(&m.name, literals)),
                    None if has_exact_positive => {
                        // candidates are already narrowed; test them directly
                        positive.push(self.postings.with_name(&m.name));
                        filters.push(m);
                    }
                    None => positive.push(self.postings.union_where(&m.name, |v| m.matches_value(v))),
                },
                (MatchOp::NotRegex, true) => {
                    positive.push(self.postings.union_where(&m.name, |v| m.matches_value(v)))
                }
                // name=""
                (MatchOp::Equal, false) => negative.push(self.postings.with_name(&m.name)),
                (MatchOp::NotEqual, false) => negative.push(self.postings.get(&m.name, &m.value)),
                (MatchOp::NotRegex, false) => match m.literals() {
                    Some(literals) => negative.push(self.postings.union_of(&m.name, literals)),
                    None => filters.push(m),
                },
                (MatchOp::Regex, false) => filters.push(m),
            }
        }

        let mut candidates = if positive.is_empty() {
            self.all.read().clone()
        } else {
            positive.sort_by_key(|bitmap| bitmap.len());
            let mut iter = positive.into_iter();
            let mut acc = iter.next().unwrap_or_default();
            for bitmap in iter {
                if acc.is_empty() {
                    break;
                }
                acc &= &bitmap;
            }
            acc
        };

        if let Some(active) = self.days.series_in(range) {
            candidates &= &active;
        }
        for bitmap in &negative {
            if candidates.is_empty() {
                break;
            }
            candidates -= bitmap;
        }

        if !filters.is_empty() {
            let mut kept = RoaringTreemap::new();
            for id in candidates.iter() {
                if let Some(labels) = self.labels_ref(id) {
                    if filters.iter().all(|m| m.matches(&labels)) {
                        kept.insert(id);
                    }
                }
            }
            candidates = kept;
        }

        Ok(candidates)
    }

    /// Sorted label names of the selected series, or of all series when
    /// `matchers` is empty
    pub fn label_names(&self, matchers: &[Matcher], range: &TimeRange) -> Result<Vec<String>> {
        if matchers.is_empty() && self.days.series_in(range).is_none() {
            return Ok(self.postings.names());
        }
        let ids = self.resolve_or_all(matchers, range)?;
        let mut names = BTreeSet::new();
        for id in ids.iter() {
            if let Some(labels) = self.labels_ref(id) {
                names.extend(labels.iter().map(|l| l.name.clone()));
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Sorted values of label `name` among the selected series
    pub fn label_values(
        &self,
        name: &str,
        matchers: &[Matcher],
        range: &TimeRange,
    ) -> Result<Vec<String>> {
        if matchers.is_empty() && self.days.series_in(range).is_none() {
            return Ok(self.postings.values(name));
        }
        let ids = self.resolve_or_all(matchers, range)?;
        let mut values = BTreeSet::new();
        for id in ids.iter() {
            if let Some(value) = self.labels_ref(id).and_then(|l| l.get(name).map(str::to_owned)) {
                values.insert(value);
            }
        }
        Ok(values.into_iter().collect())
    }

    /// Label sets of the series selected by `matchers` within `range`, sorted
    ///
    /// Fails with `TooManySeries` when more than `limit` series match.
    pub fn series(&self, matchers: &[Matcher], range: &TimeRange, limit: usize) -> Result<Vec<Labels>> {
        let ids = self.resolve_matchers(matchers, range)?;
        if ids.len() > limit as u64 {
            return Err(QuiverError::TooManySeries { limit });
        }
        let mut out: Vec<Labels> = ids
            .iter()
            .filter_map(|id| self.labels_ref(id).map(|l| (*l).clone()))
            .collect();
        out.sort();
        Ok(out)
    }

    fn resolve_or_all(&self, matchers: &[Matcher], range: &TimeRange) -> Result<RoaringTreemap> {
        if matchers.is_empty() {
            let mut all = self.all.read().clone();
            if let Some(active) = self.days.series_in(range) {
                all &= &active;
            }
            Ok(all)
        } else {
            self.resolve_matchers(matchers, range)
        }
    }

    /// Number of live series
    pub fn series_count(&self) -> u64 {
        self.all.read().len()
    }

    /// Snapshot of all live series IDs
    pub fn all_series(&self) -> RoaringTreemap {
        self.all.read().clone()
    }

    /// Remove series, recording a tombstone for each; returns how many were removed
    ///
    /// Callers must guarantee no sample for these IDs exists in live parts
    /// or buffers and that no writer is concurrently resolving them.
    pub fn remove_series(&self, ids: &RoaringTreemap) -> Result<usize> {
        let mut records = Vec::new();
        let mut removed = Vec::new();
        for id in ids.iter() {
            if let Some(labels) = self.reverse_shard(id).write().remove(&id) {
                records.push(SeriesRecord::Tombstone { id });
                removed.push((id, labels));
            }
        }
        if records.is_empty() {
            return Ok(0);
        }
        self.log.append(&records)?;

        for (id, labels) in &removed {
            self.forward_shard(labels).write().remove(labels.as_ref());
            self.postings.remove(labels, *id);
            self.all.write().remove(*id);
        }
        self.days.remove(ids);

        info!("Removed {} series from index", removed.len());
        Ok(removed.len())
    }

    /// Forget per-day entries entirely before `cutoff`
    pub fn drop_days_before(&self, cutoff: Timestamp) {
        self.days.drop_before(cutoff);
    }

    /// Make every created series durable
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Copy the series log into `dst_dir`
    pub fn snapshot_to(&self, dst_dir: &Path) -> Result<()> {
        self.log.copy_to(&dst_dir.join(SERIES_LOG_FILE))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
