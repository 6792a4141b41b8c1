//! Storage engine - ingestion, flush, merge commit, retention and search

use super::partset::PartSet;
use super::{snapshot, Layout, Manifest, StorageConfig};
use crate::index::{day_of, IndexDb};
use crate::mempart::MemPart;
use crate::merge::merger::apply_cutoff;
use crate::merge::policy::{select_forced, select_merge_candidates, select_retention};
use crate::merge::{dedup, MergeHost, MergeJob, MergeKind, MergeOptions, MergeScheduler, Merger};
use crate::part::{parse_part_id, part_path, PartHandle, PartMeta, PartWriter};
use crate::search::{SearchIter, SearchOptions};
use crate::{Labels, Matcher, MetricRow, QuiverError, Result, SeriesId, TimeRange, Timestamp};
use arc_swap::ArcSwap;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const NO_CUTOFF: Timestamp = Timestamp::MIN;

/// Part IDs reserved in the manifest per high-water bump
const PART_ID_RESERVATION: u64 = 64;

/// Outcome of one `push_batch`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub accepted: usize,
    /// Rows without labels
    pub dropped_invalid: usize,
    /// Rows too far behind their series' newest sample
    pub dropped_out_of_order: usize,
    /// Rows older than the retention cutoff
    pub dropped_retention: usize,
}

impl PushSummary {
    pub fn dropped(&self) -> usize {
        self.dropped_invalid + self.dropped_out_of_order + self.dropped_retention
    }
}

/// What a crash right now would lose
#[derive(Debug, Clone, PartialEq)]
pub struct Durability {
    /// Wall-clock time of the last committed flush
    pub last_flush: Option<DateTime<Utc>>,
    /// Newest sample timestamp in any committed part
    pub max_durable_timestamp: Option<Timestamp>,
    /// Rows buffered in MemParts
    pub pending_rows: usize,
    /// Oldest buffered sample timestamp
    pub oldest_pending_timestamp: Option<Timestamp>,
}

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub series: u64,
    pub parts: usize,
    pub part_rows: u64,
    pub part_bytes: u64,
    pub memparts: usize,
    pub mempart_rows: usize,
    pub flushes: u64,
    pub merges_done: u64,
    pub merges_failed: u64,
    pub quarantined_parts: u64,
    pub rows_accepted: u64,
    pub rows_dropped: u64,
    pub retention_cutoff: Option<Timestamp>,
}

/// Outcome of `apply_retention`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub parts_dropped: usize,
    pub parts_rewritten: usize,
    pub series_removed: usize,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    merges_done: AtomicU64,
    merges_failed: AtomicU64,
    quarantined: AtomicU64,
    rows_accepted: AtomicU64,
    rows_dropped: AtomicU64,
}

/// One atomic change of the live part set and manifest
#[derive(Default)]
struct Commit<'a> {
    add: Option<Arc<PartHandle>>,
    remove: &'a [u64],
    retire_mempart: Option<u64>,
    flushed: bool,
}

struct Inner {
    config: StorageConfig,
    layout: Layout,
    index: IndexDb,
    /// Writers hold the read guard for a whole batch; rotation and the
    /// series sweep take the write guard
    active: RwLock<Arc<MemPart>>,
    parts: ArcSwap<PartSet>,
    /// Serializes part set changes with the manifest write
    manifest: Mutex<Manifest>,
    flush_lock: Mutex<()>,
    next_part_id: AtomicU64,
    next_mempart_id: AtomicU64,
    retention_cutoff: AtomicI64,
    max_durable_ts: AtomicI64,
    snapshot_seq: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
    counters: Counters,
}

/// The QuiverDB storage engine
pub struct Engine {
    inner: Arc<Inner>,
    scheduler: Mutex<Option<MergeScheduler>>,
}

impl Engine {
    /// Open or create the engine in `config.data_dir`
    ///
    /// Recovery: leftover temporary files are removed, parts listed in the
    /// manifest are opened and verified (bad ones are quarantined), part
    /// files missing from the manifest are deleted as orphans, and the
    /// per-day index is rebuilt from the part block indexes.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let layout = Layout::new(&config.data_dir);
        layout.create_all()?;
        clear_dir(&layout.tmp)?;

        let index = IndexDb::open(&layout.index, &config.index)?;
        let existing = Manifest::load(&layout.root)?;
        let mut dirty = existing.is_none();
        let mut manifest = existing.unwrap_or_default();

        let mut parts = Vec::with_capacity(manifest.parts.len());
        let mut quarantined = 0;
        for meta in &manifest.parts {
            match open_part(&layout, meta)? {
                Some(handle) => parts.push(Arc::new(handle)),
                None => {
                    quarantined += 1;
                    dirty = true;
                }
            }
        }

        let mut max_seen_id = parts.iter().map(|p| p.id()).max().unwrap_or(0);
        for entry in fs::read_dir(&layout.parts)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let id = parse_part_id(&path);
            if id.map_or(false, |id| parts.iter().any(|p| p.id() == id)) {
                continue;
            }
            max_seen_id = max_seen_id.max(id.unwrap_or(0));
            fs::remove_file(&path)?;
            info!("Removed orphaned part file {:?}", path);
        }

        let known = index.all_series();
        let mut max_durable_ts = NO_CUTOFF;
        for part in &parts {
            let mut unknown = part.series_ids().clone();
            unknown -= &known;
            if !unknown.is_empty() {
                return Err(QuiverError::IndexCorruption(format!(
                    "part {} references {} series missing from the index",
                    part.id(),
                    unknown.len()
                )));
            }
            for block in part.block_refs() {
                index.mark_days(block.series_id, block.first_timestamp, block.last_timestamp);
            }
            if part.meta().rows > 0 {
                max_durable_ts = max_durable_ts.max(part.meta().max_timestamp);
            }
        }

        let cutoff = manifest.retention_cutoff.unwrap_or(NO_CUTOFF);
        if let Some(cutoff) = manifest.retention_cutoff {
            index.drop_days_before(cutoff);
        }

        let next_part_id = manifest.next_part_id.max(max_seen_id + 1).max(1);
        if dirty || next_part_id != manifest.next_part_id {
            manifest.generation += 1;
            manifest.next_part_id = next_part_id;
            manifest.parts = parts.iter().map(|p| p.meta().clone()).collect();
            manifest.store(&layout.root)?;
        }

        let snapshot_seq = snapshot::list(&layout.snapshots)?.len() as u64;
        let policy = config.mempart.out_of_order;
        let inner = Arc::new(Inner {
            layout,
            index,
            active: RwLock::new(Arc::new(MemPart::new(1, policy))),
            parts: ArcSwap::from_pointee(PartSet::new(parts)),
            manifest: Mutex::new(manifest),
            flush_lock: Mutex::new(()),
            next_part_id: AtomicU64::new(next_part_id),
            next_mempart_id: AtomicU64::new(2),
            retention_cutoff: AtomicI64::new(cutoff),
            max_durable_ts: AtomicI64::new(max_durable_ts),
            snapshot_seq: AtomicU64::new(snapshot_seq),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
            config,
        });
        inner.counters.quarantined.store(quarantined, Ordering::Relaxed);

        let scheduler = if inner.config.merge.auto_merge {
            let host: Arc<dyn MergeHost> = inner.clone();
            Some(MergeScheduler::start(host, &inner.config.merge, inner.shutdown.clone())?)
        } else {
            None
        };

        info!(
            "Opened engine at {:?}: {} parts, {} series",
            inner.layout.root,
            inner.parts.load().parts.len(),
            inner.index.series_count()
        );

        Ok(Self {
            inner,
            scheduler: Mutex::new(scheduler),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.layout.root
    }

    /// Ingest a batch of rows
    ///
    /// Rows without labels, rows older than the retention cutoff and rows
    /// rejected by the out-of-order policy are dropped and counted; the
    /// rest of the batch is still applied. Fails only on index or I/O
    /// errors.
    pub fn push_batch(&self, rows: &[MetricRow]) -> Result<PushSummary> {
        self.inner.ensure_open()?;
        let summary = self.inner.push(rows);

        let counters = &self.inner.counters;
        let (accepted, dropped) = match &summary {
            Ok(s) => (s.accepted, s.dropped()),
            Err(_) => (0, 0),
        };
        counters.rows_accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        counters.rows_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        let summary = summary?;

        if let Err(e) = self.inner.maybe_flush() {
            error!("Flush failed, MemPart kept in memory: {}", e);
        }
        Ok(summary)
    }

    /// Search with default options
    pub fn search(&self, matchers: &[Matcher], range: TimeRange) -> Result<SearchIter> {
        self.search_with(matchers, range, SearchOptions::default())
    }

    /// Resolve `matchers` and snapshot the live parts for a lazy scan
    pub fn search_with(
        &self,
        matchers: &[Matcher],
        range: TimeRange,
        options: SearchOptions,
    ) -> Result<SearchIter> {
        let inner = &self.inner;
        inner.ensure_open()?;
        options.check()?;

        let range = match inner.cutoff() {
            Some(cutoff) => TimeRange::new(range.start.max(cutoff), range.end),
            None => range,
        };
        if range.is_empty() {
            return Ok(SearchIter::empty());
        }

        let series = inner.index.resolve_matchers(matchers, &range)?;
        let limit = options.max_series.unwrap_or(inner.config.max_series_per_search);
        if series.len() > limit as u64 {
            return Err(QuiverError::TooManySeries { limit });
        }

        // the active MemPart first: a rotation in between leaves it in the set
        let active = inner.active.read().clone();
        let set = inner.parts.load_full();
        let mut memparts: Vec<Arc<MemPart>> = set.memparts.clone();
        memparts.push(active);
        memparts.retain(|m| m.time_range().map_or(false, |r| r.overlaps(&range)));
        let parts = set.parts_overlapping(&range);

        Ok(SearchIter::new(
            series.iter().collect(),
            memparts,
            parts,
            range,
            inner.config.dedup_interval_ms,
            options,
        ))
    }

    /// Labels of a series
    pub fn series_labels(&self, series_id: SeriesId) -> Option<Labels> {
        self.inner.index.labels(series_id)
    }

    /// Sorted label names of the series selected by `matchers`
    pub fn label_names(&self, matchers: &[Matcher], range: TimeRange) -> Result<Vec<String>> {
        self.inner.index.label_names(matchers, &range)
    }

    /// Sorted values of label `name` among the series selected by `matchers`
    pub fn label_values(&self, name: &str, matchers: &[Matcher], range: TimeRange) -> Result<Vec<String>> {
        self.inner.index.label_values(name, matchers, &range)
    }

    /// Label sets of the series selected by `matchers`, capped like a search
    pub fn series(&self, matchers: &[Matcher], range: TimeRange) -> Result<Vec<Labels>> {
        self.inner
            .index
            .series(matchers, &range, self.inner.config.max_series_per_search)
    }

    pub fn series_count(&self) -> u64 {
        self.inner.index.series_count()
    }

    /// Flush the active MemPart and any pending frozen ones
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.flush()
    }

    /// Merge live parts down to one
    ///
    /// Parts claimed by a background merge at the time are left to it, so
    /// more than one part may remain.
    pub fn force_merge(&self) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.flush()?;

        loop {
            let idle = inner.parts.load().idle_parts();
            let metas: Vec<PartMeta> = idle.iter().map(|p| p.meta().clone()).collect();
            let Some(ids) = select_forced(&metas, &inner.config.merge) else {
                break;
            };
            let Some(job) = claim(MergeKind::Forced, &idle, &ids) else {
                continue;
            };
            if let Err(e) = inner.run_job(&job, &inner.shutdown) {
                inner.release(&job);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Expire every sample older than `cutoff`
    ///
    /// Searches stop returning expired samples immediately. Parts entirely
    /// before the cutoff are dropped, parts straddling it are rewritten,
    /// and series left without samples are removed from the index. The
    /// cutoff never moves backwards.
    pub fn apply_retention(&self, cutoff: Timestamp) -> Result<RetentionReport> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let previous = inner.retention_cutoff.fetch_max(cutoff, Ordering::SeqCst);
        let cutoff = cutoff.max(previous);
        if cutoff != previous {
            inner.commit(Commit::default())?;
            info!("Retention cutoff moved to {}", cutoff);
        }
        inner.index.drop_days_before(cutoff);

        let parts_dropped = inner.drop_expired(cutoff)?;
        let mut parts_rewritten = 0;
        for job in inner.plan_retention_rewrites(cutoff, usize::MAX) {
            if let Err(e) = inner.run_job(&job, &inner.shutdown) {
                inner.release(&job);
                return Err(e);
            }
            parts_rewritten += 1;
        }
        let series_removed = inner.sweep_series()?;

        info!(
            "Applied retention at {}: dropped {} parts, rewrote {}, removed {} series",
            cutoff, parts_dropped, parts_rewritten, series_removed
        );
        Ok(RetentionReport {
            parts_dropped,
            parts_rewritten,
            series_removed,
        })
    }

    /// Re-read every block of every live part; corrupt parts are
    /// quarantined and their IDs returned
    pub fn verify_parts(&self) -> Result<Vec<u64>> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let set = inner.parts.load_full();
        let mut corrupt = Vec::new();
        for part in set.parts.iter().filter(|p| !p.is_quarantined()) {
            match part.verify() {
                Ok(()) => {}
                Err(e) if e.is_corruption() => {
                    part.quarantine(&e);
                    corrupt.push(part.id());
                }
                Err(e) => return Err(e),
            }
        }
        drop(set);

        inner.sweep_quarantined()?;
        Ok(corrupt)
    }

    /// Durability watermark
    pub fn durability(&self) -> Durability {
        let inner = &self.inner;
        let active = inner.active.read().clone();
        let set = inner.parts.load();

        let mut pending_rows = 0;
        let mut oldest: Option<Timestamp> = None;
        for mempart in set.memparts.iter().chain(std::iter::once(&active)) {
            pending_rows += mempart.rows();
            if let Some(range) = mempart.time_range() {
                oldest = Some(oldest.map_or(range.start, |o| o.min(range.start)));
            }
        }

        let last_flush = inner
            .manifest
            .lock()
            .last_flush_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        let max_durable = inner.max_durable_ts.load(Ordering::Acquire);

        Durability {
            last_flush,
            max_durable_timestamp: (max_durable != NO_CUTOFF).then_some(max_durable),
            pending_rows,
            oldest_pending_timestamp: oldest,
        }
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let active = inner.active.read().clone();
        let set = inner.parts.load();
        let counters = &inner.counters;

        EngineStats {
            series: inner.index.series_count(),
            parts: set.parts.len(),
            part_rows: set.parts.iter().map(|p| p.meta().rows).sum(),
            part_bytes: set.parts.iter().map(|p| p.meta().size_bytes).sum(),
            memparts: set.memparts.len() + 1,
            mempart_rows: set.memparts.iter().map(|m| m.rows()).sum::<usize>() + active.rows(),
            flushes: counters.flushes.load(Ordering::Relaxed),
            merges_done: counters.merges_done.load(Ordering::Relaxed),
            merges_failed: counters.merges_failed.load(Ordering::Relaxed),
            quarantined_parts: counters.quarantined.load(Ordering::Relaxed),
            rows_accepted: counters.rows_accepted.load(Ordering::Relaxed),
            rows_dropped: counters.rows_dropped.load(Ordering::Relaxed),
            retention_cutoff: inner.cutoff(),
        }
    }

    /// Flush, then hard-link the live parts into a new snapshot; returns
    /// its name
    pub fn create_snapshot(&self) -> Result<String> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.flush()?;
        inner.index.sync()?;

        // no commit can retire a part while the manifest is held
        let manifest = inner.manifest.lock();
        let set = inner.parts.load_full();
        let parts: Vec<Arc<PartHandle>> = set.parts.iter().filter(|p| !p.is_quarantined()).cloned().collect();
        let mut contents = manifest.clone();
        contents.parts.retain(|m| parts.iter().any(|p| p.id() == m.id));

        let name = snapshot::new_name(inner.snapshot_seq.fetch_add(1, Ordering::Relaxed));
        snapshot::create(&inner.layout.snapshots, &name, &parts, &contents, &inner.index)?;
        Ok(name)
    }

    /// Snapshot names, oldest first
    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        snapshot::list(&self.inner.layout.snapshots)
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        snapshot::delete(&self.inner.layout.snapshots, name)
    }

    /// Delete snapshots older than `max_age`, returning their names
    pub fn delete_stale_snapshots(&self, max_age: Duration) -> Result<Vec<String>> {
        snapshot::delete_stale(&self.inner.layout.snapshots, max_age, Utc::now())
    }

    /// Stop background merging, flush everything and close
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
        inner.shutdown.cancel();

        let result = inner.flush().and_then(|_| inner.index.sync());
        inner.closed.store(true, Ordering::Release);
        info!("Closed engine at {:?}", inner.layout.root);
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close engine cleanly: {}", e);
        }
    }
}

/// Reject a row that can never be stored
fn admit(row: &MetricRow, cutoff: Option<Timestamp>) -> Result<()> {
    if row.labels.is_empty() {
        return Err(QuiverError::InvalidSample("empty label set".into()));
    }
    match cutoff {
        Some(cutoff) if row.timestamp < cutoff => Err(QuiverError::OutsideRetention {
            timestamp: row.timestamp,
            cutoff,
        }),
        _ => Ok(()),
    }
}

/// Open one manifest part; `None` if it was quarantined
fn open_part(layout: &Layout, meta: &PartMeta) -> Result<Option<PartHandle>> {
    let path = part_path(&layout.parts, meta.id);
    match PartHandle::open(&path, meta.id, &layout.quarantine) {
        Ok(handle) if handle.meta() == meta => Ok(Some(handle)),
        Ok(handle) => {
            handle.quarantine(&QuiverError::Corruption(format!(
                "part {} does not match its manifest entry",
                meta.id
            )));
            Ok(None)
        }
        Err(QuiverError::Io(e)) if e.kind() == ErrorKind::NotFound => Err(QuiverError::Corruption(format!(
            "part {} listed in the manifest is missing",
            meta.id
        ))),
        Err(e) if e.is_corruption() || matches!(e, QuiverError::InvalidFormat(_) | QuiverError::Compression(_)) => {
            quarantine_file(layout, &path, meta.id, &e)?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn quarantine_file(layout: &Layout, path: &Path, id: u64, reason: &QuiverError) -> Result<()> {
    error!("Quarantining part {} on open: {}", id, reason);
    fs::create_dir_all(&layout.quarantine)?;
    fs::rename(path, layout.quarantine.join(crate::part::part_file_name(id)))?;
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            debug!("Removed leftover temporary file {:?}", entry.path());
        }
    }
    Ok(())
}

/// Claim every part named in `ids` for one job, or none of them
fn claim(kind: MergeKind, candidates: &[Arc<PartHandle>], ids: &[u64]) -> Option<MergeJob> {
    let mut parts: Vec<Arc<PartHandle>> = Vec::with_capacity(ids.len());
    for id in ids {
        let part = candidates.iter().find(|p| p.id() == *id)?;
        if !part.try_claim() {
            for claimed in &parts {
                claimed.release();
            }
            return None;
        }
        parts.push(part.clone());
    }
    Some(MergeJob { kind, parts })
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuiverError::Closed);
        }
        Ok(())
    }

    fn cutoff(&self) -> Option<Timestamp> {
        let cutoff = self.retention_cutoff.load(Ordering::Acquire);
        (cutoff != NO_CUTOFF).then_some(cutoff)
    }

    fn push(&self, rows: &[MetricRow]) -> Result<PushSummary> {
        let cutoff = self.cutoff();
        let mut summary = PushSummary::default();
        let mut ids: HashMap<&Labels, SeriesId> = HashMap::new();
        let mut days: HashSet<(SeriesId, i64)> = HashSet::new();

        let active = self.active.read();
        for row in rows {
            match admit(row, cutoff) {
                Ok(()) => {}
                Err(QuiverError::OutsideRetention { .. }) => {
                    summary.dropped_retention += 1;
                    continue;
                }
                Err(e) => {
                    debug!("Dropping row: {}", e);
                    summary.dropped_invalid += 1;
                    continue;
                }
            }

            let id = match ids.get(&row.labels) {
                Some(id) => *id,
                None => match self.index.get_or_create_series_id(&row.labels) {
                    Ok(id) => {
                        ids.insert(&row.labels, id);
                        id
                    }
                    Err(QuiverError::InvalidSample(reason)) => {
                        debug!("Dropping row: {}", reason);
                        summary.dropped_invalid += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            if days.insert((id, day_of(row.timestamp))) {
                self.index.mark_day(id, row.timestamp);
            }
            match active.append(id, row.timestamp, row.value) {
                Ok(()) => summary.accepted += 1,
                Err(QuiverError::OutOfOrder { .. }) => summary.dropped_out_of_order += 1,
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Flush if a threshold is crossed or a frozen MemPart is pending,
    /// unless another thread is already flushing
    fn maybe_flush(&self) -> Result<()> {
        let due = self.active.read().should_flush(&self.config.mempart)
            || !self.parts.load().memparts.is_empty();
        if !due {
            return Ok(());
        }
        let Some(_guard) = self.flush_lock.try_lock() else {
            return Ok(());
        };
        if self.active.read().should_flush(&self.config.mempart) {
            self.rotate();
        }
        self.write_pending()
    }

    fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        self.rotate();
        self.write_pending()
    }

    /// Freeze the active MemPart and install a fresh one
    fn rotate(&self) {
        let mut active = self.active.write();
        if active.is_empty() {
            return;
        }
        {
            let _manifest = self.manifest.lock();
            let current = self.parts.load();
            self.parts.store(Arc::new(current.with_mempart(active.clone())));
        }
        let id = self.next_mempart_id.fetch_add(1, Ordering::Relaxed);
        let frozen = std::mem::replace(&mut *active, Arc::new(MemPart::new(id, self.config.mempart.out_of_order)));
        drop(active);

        frozen.seal();
        debug!("Froze MemPart {} with {} rows", frozen.id(), frozen.rows());
    }

    fn write_pending(&self) -> Result<()> {
        let pending = self.parts.load().memparts.clone();
        for mempart in &pending {
            self.write_mempart(mempart)?;
        }
        Ok(())
    }

    /// Serialize a frozen MemPart into a part and swap it in
    fn write_mempart(&self, mempart: &Arc<MemPart>) -> Result<()> {
        // every series in the part must be recoverable from the series log
        self.index.sync()?;

        let id = self.allocate_part_id()?;
        let mut writer = PartWriter::create(&self.layout.tmp, id, 0, self.config.part.clone())?;
        let cutoff = self.cutoff();
        for mut cols in mempart.iter_series() {
            if let Some(cutoff) = cutoff {
                apply_cutoff(&mut cols.timestamps, &mut cols.values, cutoff);
            }
            dedup::dedup_interval(&mut cols.timestamps, &mut cols.values, self.config.dedup_interval_ms);
            writer.add_series(cols.series_id, &cols.timestamps, &cols.values)?;
        }

        let add = if writer.is_empty() {
            drop(writer);
            None
        } else {
            writer.finish(&self.layout.parts)?;
            let handle = PartHandle::open(&part_path(&self.layout.parts, id), id, &self.layout.quarantine)?;
            Some(Arc::new(handle))
        };
        let max_ts = add.as_ref().map(|p| p.meta().max_timestamp);
        let rows = add.as_ref().map_or(0, |p| p.meta().rows);

        self.commit(Commit {
            add,
            remove: &[],
            retire_mempart: Some(mempart.id()),
            flushed: true,
        })?;

        if let Some(ts) = max_ts {
            self.max_durable_ts.fetch_max(ts, Ordering::AcqRel);
        }
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        info!("Flushed MemPart {} into part {} ({} rows)", mempart.id(), id, rows);
        Ok(())
    }

    /// Hand out a part ID
    ///
    /// IDs are reserved in the manifest in batches before use, so an ID held
    /// by a write that never commits is not handed out again after a restart.
    fn allocate_part_id(&self) -> Result<u64> {
        let mut manifest = self.manifest.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(QuiverError::Closed);
        }
        let id = self.next_part_id.fetch_add(1, Ordering::SeqCst);
        if id >= manifest.next_part_id {
            let next = Manifest {
                generation: manifest.generation + 1,
                next_part_id: id + PART_ID_RESERVATION,
                ..manifest.clone()
            };
            next.store(&self.layout.root)?;
            *manifest = next;
        }
        Ok(id)
    }

    /// Write the next manifest and publish the matching part set
    fn commit(&self, change: Commit<'_>) -> Result<()> {
        let mut manifest = self.manifest.lock();
        let result = self.commit_locked(&mut manifest, &change);
        if result.is_err() {
            if let Some(part) = &change.add {
                part.mark_obsolete();
            }
        }
        result
    }

    fn commit_locked(&self, manifest: &mut Manifest, change: &Commit<'_>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuiverError::Closed);
        }

        let current = self.parts.load_full();
        if let Some(missing) = change.remove.iter().find(|id| current.get(**id).is_none()) {
            return Err(QuiverError::Merge(format!("part {} is no longer live", missing)));
        }

        let next_set = current.apply(change.add.as_ref(), change.remove, change.retire_mempart);
        let next = Manifest {
            generation: manifest.generation + 1,
            next_part_id: manifest.next_part_id.max(self.next_part_id.load(Ordering::SeqCst)),
            retention_cutoff: self.cutoff(),
            last_flush_ms: if change.flushed {
                Some(Utc::now().timestamp_millis())
            } else {
                manifest.last_flush_ms
            },
            parts: next_set.metas(),
            ..manifest.clone()
        };
        next.store(&self.layout.root)?;

        *manifest = next;
        self.parts.store(Arc::new(next_set));
        for id in change.remove {
            if let Some(part) = current.get(*id) {
                part.mark_obsolete();
                part.release();
            }
        }
        Ok(())
    }

    fn merge_into(&self, job: &MergeJob, cancel: &CancellationToken) -> Result<()> {
        let inputs = job.part_ids();
        let level = job.parts.iter().map(|p| p.meta().level).max().unwrap_or(0) + 1;
        let id = self.allocate_part_id()?;
        info!("Starting {} merge of parts {:?} into part {}", job.kind, inputs, id);

        let mut writer = PartWriter::create(&self.layout.tmp, id, level, self.config.part.clone())?;
        let options = MergeOptions {
            retention_cutoff: self.cutoff(),
            dedup_interval: self.config.dedup_interval_ms,
            cancel: Some(cancel.clone()),
        };
        let outcome = Merger::new(&job.parts, options).run(&mut writer)?;

        let add = if writer.is_empty() {
            drop(writer);
            None
        } else {
            writer.finish(&self.layout.parts)?;
            let handle = PartHandle::open(&part_path(&self.layout.parts, id), id, &self.layout.quarantine)?;
            Some(Arc::new(handle))
        };
        self.commit(Commit {
            add,
            remove: &inputs,
            retire_mempart: None,
            flushed: false,
        })?;

        info!(
            "Merged parts {:?} into part {} ({} -> {} rows)",
            inputs, id, outcome.rows_in, outcome.rows_out
        );
        Ok(())
    }

    /// Quarantine whichever inputs of a failed merge are corrupt
    fn quarantine_corrupt_inputs(&self, job: &MergeJob) {
        for part in &job.parts {
            if let Err(e) = part.verify() {
                if e.is_corruption() {
                    part.quarantine(&e);
                }
            }
        }
    }

    /// Remove quarantined parts from the live set
    fn sweep_quarantined(&self) -> Result<usize> {
        let ids: Vec<u64> = self
            .parts
            .load()
            .parts
            .iter()
            .filter(|p| p.is_quarantined())
            .map(|p| p.id())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.commit(Commit {
            remove: &ids,
            ..Default::default()
        })?;
        self.counters.quarantined.fetch_add(ids.len() as u64, Ordering::Relaxed);
        warn!("Removed quarantined parts {:?} from the live set", ids);
        Ok(ids.len())
    }

    /// Drop idle parts lying entirely before `cutoff`
    fn drop_expired(&self, cutoff: Timestamp) -> Result<usize> {
        let idle = self.parts.load().idle_parts();
        let metas: Vec<PartMeta> = idle.iter().map(|p| p.meta().clone()).collect();
        let plan = select_retention(&metas, cutoff);
        if plan.drop.is_empty() {
            return Ok(0);
        }

        let Some(job) = claim(MergeKind::Retention, &idle, &plan.drop) else {
            return Ok(0);
        };
        let ids = job.part_ids();
        if let Err(e) = self.commit(Commit {
            remove: &ids,
            ..Default::default()
        }) {
            self.release(&job);
            return Err(e);
        }
        info!("Dropped expired parts {:?}", ids);
        Ok(ids.len())
    }

    /// One claimed rewrite job per idle part straddling `cutoff`
    fn plan_retention_rewrites(&self, cutoff: Timestamp, max_jobs: usize) -> Vec<MergeJob> {
        let idle = self.parts.load().idle_parts();
        let metas: Vec<PartMeta> = idle.iter().map(|p| p.meta().clone()).collect();
        select_retention(&metas, cutoff)
            .rewrite
            .into_iter()
            .filter_map(|id| claim(MergeKind::Retention, &idle, &[id]))
            .take(max_jobs)
            .collect()
    }

    fn plan_tiered(&self) -> Option<MergeJob> {
        let idle = self.parts.load().idle_parts();
        let metas: Vec<PartMeta> = idle.iter().map(|p| p.meta().clone()).collect();
        let ids = select_merge_candidates(&metas, &self.config.merge)?;
        claim(MergeKind::Tiered, &idle, &ids)
    }

    /// Remove series with no samples in any part or MemPart
    fn sweep_series(&self) -> Result<usize> {
        let active = self.active.write();
        let set = self.parts.load();

        let mut live = RoaringTreemap::new();
        for part in &set.parts {
            live |= part.series_ids();
        }
        for mempart in set.memparts.iter().chain(std::iter::once(&*active)) {
            live.extend(mempart.series_ids());
        }

        let mut dead = self.index.all_series();
        dead -= &live;
        if dead.is_empty() {
            return Ok(0);
        }
        self.index.remove_series(&dead)
    }
}

impl MergeHost for Inner {
    fn maintain(&self, max_jobs: usize) -> Vec<MergeJob> {
        if self.closed.load(Ordering::Acquire) {
            return Vec::new();
        }
        if let Err(e) = self.maybe_flush() {
            error!("Background flush failed: {}", e);
        }
        if let Err(e) = self.sweep_quarantined() {
            error!("Failed to remove quarantined parts: {}", e);
        }

        let mut jobs = Vec::new();
        if let Some(cutoff) = self.cutoff() {
            match self.drop_expired(cutoff) {
                Ok(0) => {}
                Ok(_) => {
                    if let Err(e) = self.sweep_series() {
                        error!("Series sweep failed: {}", e);
                    }
                }
                Err(e) => error!("Failed to drop expired parts: {}", e),
            }
            jobs.extend(self.plan_retention_rewrites(cutoff, max_jobs));
        }

        while jobs.len() < max_jobs {
            match self.plan_tiered() {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        jobs
    }

    fn run_job(&self, job: &MergeJob, cancel: &CancellationToken) -> Result<()> {
        if job.parts.iter().any(|p| p.is_obsolete() || p.is_quarantined()) {
            debug!("Dropping stale merge of parts {:?}", job.part_ids());
            self.release(job);
            return Ok(());
        }

        match self.merge_into(job, cancel) {
            Ok(()) => {
                self.counters.merges_done.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.merges_failed.fetch_add(1, Ordering::Relaxed);
                if e.is_corruption() {
                    self.quarantine_corrupt_inputs(job);
                }
                warn!("Merge of parts {:?} failed: {}", job.part_ids(), e);
                Err(e)
            }
        }
    }

    fn release(&self, job: &MergeJob) {
        for part in &job.parts {
            part.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempart::OutOfOrderPolicy;
    use tempfile::TempDir;

    fn config(dir: &Path) -> StorageConfig {
        let mut config = StorageConfig::new(dir);
        config.merge.auto_merge = false;
        config
    }

    fn row(host: &str, ts: i64, value: f64) -> MetricRow {
        MetricRow::new(Labels::from_pairs([("__name__", "cpu"), ("host", host)]), ts, value)
    }

    fn host(name: &str) -> Vec<Matcher> {
        vec![Matcher::equal("host", name).unwrap()]
    }

    fn values(engine: &Engine, matchers: &[Matcher]) -> Vec<(i64, f64)> {
        engine
            .search(matchers, TimeRange::all())
            .unwrap()
            .map(|s| s.unwrap())
            .map(|s| (s.timestamp, s.value))
            .collect()
    }

    #[test]
    fn test_push_summary_counts_drops() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();

        let rows = vec![
            row("a", 100_000, 1.0),
            MetricRow::new(Labels::default(), 100, 1.0),
            row("a", 10, 2.0),
            row("a", 100_500, 3.0),
        ];
        let summary = engine.push_batch(&rows).unwrap();
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.dropped_invalid, 1);
        assert_eq!(summary.dropped_out_of_order, 1);
        assert_eq!(summary.dropped(), 2);

        let stats = engine.stats();
        assert_eq!((stats.rows_accepted, stats.rows_dropped), (2, 2));
        assert_eq!(stats.mempart_rows, 2);
    }

    #[test]
    fn test_admit_classifies_rejected_rows() {
        assert!(admit(&row("a", 10, 1.0), Some(10)).is_ok());
        assert!(admit(&row("a", i64::MIN, 1.0), None).is_ok());
        assert!(matches!(
            admit(&row("a", 9, 1.0), Some(10)),
            Err(QuiverError::OutsideRetention { timestamp: 9, cutoff: 10 })
        ));
        assert!(matches!(
            admit(&MetricRow::new(Labels::default(), 9, 1.0), Some(10)),
            Err(QuiverError::InvalidSample(_))
        ));

        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.apply_retention(1_000).unwrap();
        let summary = engine.push_batch(&[row("a", 999, 1.0), row("a", 1_000, 2.0)]).unwrap();
        assert_eq!((summary.accepted, summary.dropped_retention), (1, 1));
    }

    #[test]
    fn test_flush_moves_rows_to_part() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.push_batch(&[row("a", 100, 1.0), row("a", 200, 2.0)]).unwrap();

        let before = engine.durability();
        assert_eq!(before.pending_rows, 2);
        assert_eq!(before.oldest_pending_timestamp, Some(100));
        assert_eq!(before.max_durable_timestamp, None);

        engine.flush().unwrap();
        let after = engine.durability();
        assert_eq!(after.pending_rows, 0);
        assert_eq!(after.max_durable_timestamp, Some(200));
        assert!(after.last_flush.is_some());

        let stats = engine.stats();
        assert_eq!((stats.parts, stats.part_rows, stats.flushes), (1, 2, 1));
        assert_eq!(values(&engine, &host("a")), vec![(100, 1.0), (200, 2.0)]);

        // nothing buffered: no empty part
        engine.flush().unwrap();
        assert_eq!(engine.stats().parts, 1);
    }

    #[test]
    fn test_row_threshold_flushes_inline() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.mempart.max_rows = 10;
        let engine = Engine::open(cfg).unwrap();

        let rows: Vec<MetricRow> = (0..25).map(|i| row("a", i * 10, i as f64)).collect();
        for chunk in rows.chunks(5) {
            engine.push_batch(chunk).unwrap();
        }
        let stats = engine.stats();
        assert_eq!(stats.parts, 2);
        assert_eq!(stats.mempart_rows, 5);
        assert_eq!(values(&engine, &host("a")).len(), 25);
    }

    #[test]
    fn test_out_of_order_accept_policy() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.mempart.out_of_order = OutOfOrderPolicy::Accept;
        let engine = Engine::open(cfg).unwrap();

        engine.push_batch(&[row("a", 1_000_000, 1.0), row("a", 5, 2.0)]).unwrap();
        assert_eq!(values(&engine, &host("a")), vec![(5, 2.0), (1_000_000, 1.0)]);
    }

    #[test]
    fn test_closed_engine_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.push_batch(&[row("a", 1, 1.0)]).unwrap();
        engine.close().unwrap();
        engine.close().unwrap();

        assert!(matches!(engine.push_batch(&[row("a", 2, 1.0)]), Err(QuiverError::Closed)));
        assert!(matches!(engine.search(&host("a"), TimeRange::all()), Err(QuiverError::Closed)));
    }

    #[test]
    fn test_too_many_series() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        let rows: Vec<MetricRow> = (0..5).map(|i| row(&format!("h{}", i), 1, 1.0)).collect();
        engine.push_batch(&rows).unwrap();

        let cpu = [Matcher::equal("__name__", "cpu").unwrap()];
        let options = SearchOptions::default().with_max_series(4);
        let result = engine.search_with(&cpu, TimeRange::all(), options);
        assert!(matches!(result, Err(QuiverError::TooManySeries { limit: 4 })));
        assert_eq!(engine.search(&cpu, TimeRange::all()).unwrap().count(), 5);
    }

    #[test]
    fn test_orphans_and_tmp_removed_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(config(dir.path())).unwrap();
            engine.push_batch(&[row("a", 1, 1.0)]).unwrap();
            engine.close().unwrap();
        }
        let orphan = part_path(&dir.path().join("parts"), 999);
        fs::write(&orphan, b"partial").unwrap();
        fs::write(dir.path().join("tmp").join("0000000000000aaa.part"), b"x").unwrap();

        let engine = Engine::open(config(dir.path())).unwrap();
        assert!(!orphan.exists());
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
        assert_eq!(values(&engine, &host("a")), vec![(1, 1.0)]);

        // IDs never go backwards past a removed orphan
        engine.push_batch(&[row("a", 2, 1.0)]).unwrap();
        engine.flush().unwrap();
        let manifest = Manifest::load(dir.path()).unwrap().unwrap();
        assert!(manifest.parts.iter().any(|p| p.id >= 1000));
    }

    #[test]
    fn test_uncommitted_part_ids_not_reused_after_restart() {
        let dir = TempDir::new().unwrap();
        let held = {
            let engine = Engine::open(config(dir.path())).unwrap();
            let held = engine.inner.allocate_part_id().unwrap();
            let stored = Manifest::load(dir.path()).unwrap().unwrap();
            assert!(stored.next_part_id > held);

            // a commit does not pull the reserved mark back
            engine.push_batch(&[row("a", 1, 1.0)]).unwrap();
            engine.flush().unwrap();
            let stored = Manifest::load(dir.path()).unwrap().unwrap();
            assert!(stored.next_part_id > held + 1);
            engine.close().unwrap();
            assert!(matches!(engine.inner.allocate_part_id(), Err(QuiverError::Closed)));
            held
        };

        let engine = Engine::open(config(dir.path())).unwrap();
        assert!(engine.inner.allocate_part_id().unwrap() > held + 1);
        assert_eq!(values(&engine, &host("a")), vec![(1, 1.0)]);
    }

    #[test]
    fn test_missing_part_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(config(dir.path())).unwrap();
            engine.push_batch(&[row("a", 1, 1.0)]).unwrap();
            engine.close().unwrap();
        }
        let manifest = Manifest::load(dir.path()).unwrap().unwrap();
        fs::remove_file(part_path(&dir.path().join("parts"), manifest.parts[0].id)).unwrap();

        let err = Engine::open(config(dir.path())).err().unwrap();
        assert!(err.is_corruption());
    }
}
