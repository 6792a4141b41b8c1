//! Background merging of parts
//!
//! - [`dedup`]: duplicate resolution shared by flush, merge and search
//! - [`policy`]: size-tiered selection of merge candidates
//! - [`merger`]: k-way merge of parts into one output part
//! - [`scheduler`]: worker pool, bounded job queue and maintenance ticker

pub mod dedup;
pub mod merger;
pub mod policy;
pub mod scheduler;

pub use merger::{merge_runs, MergeOptions, Merger};
pub use policy::{select_merge_candidates, select_retention, RetentionPlan};
pub use scheduler::{MergeHost, MergeJob, MergeKind, MergeScheduler};

use crate::{QuiverError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Merge scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Merge worker threads
    pub workers: usize,
    /// Pending merge jobs before new candidates are skipped
    pub queue_capacity: usize,
    /// Merge a tier once it holds more than this many parts
    pub max_parts_per_tier: usize,
    /// Maximum input parts of one merge
    pub max_merge_fanin: usize,
    /// Upper size bound of tier 0 in bytes
    pub tier_base_bytes: u64,
    /// Size ratio between consecutive tiers
    pub tier_ratio: u64,
    /// Stop adding inputs once their total size exceeds this
    pub max_output_bytes: u64,
    /// Maintenance tick interval
    pub check_interval: Duration,
    /// First retry delay after a failed merge
    pub retry_base: Duration,
    /// Retry delay cap
    pub retry_max: Duration,
    /// Run the background scheduler; when off, merges only happen on
    /// `force_merge` and `apply_retention`
    pub auto_merge: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            workers: crate::config::MERGE_WORKERS,
            queue_capacity: crate::config::MERGE_QUEUE_CAPACITY,
            max_parts_per_tier: crate::config::MAX_PARTS_PER_TIER,
            max_merge_fanin: crate::config::MAX_MERGE_FANIN,
            tier_base_bytes: crate::config::TIER_BASE_BYTES,
            tier_ratio: crate::config::TIER_RATIO,
            max_output_bytes: crate::config::MAX_MERGE_OUTPUT_BYTES,
            check_interval: crate::config::MERGE_CHECK_INTERVAL,
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(30),
            auto_merge: true,
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(QuiverError::Config("merge.workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(QuiverError::Config("merge.queue_capacity must be at least 1".into()));
        }
        if self.max_merge_fanin < 2 {
            return Err(QuiverError::Config("merge.max_merge_fanin must be at least 2".into()));
        }
        if self.max_parts_per_tier == 0 {
            return Err(QuiverError::Config("merge.max_parts_per_tier must be at least 1".into()));
        }
        if self.tier_ratio < 2 || self.tier_base_bytes == 0 {
            return Err(QuiverError::Config(
                "merge tiers need tier_base_bytes > 0 and tier_ratio >= 2".into(),
            ));
        }
        if self.check_interval.is_zero() {
            return Err(QuiverError::Config("merge.check_interval must be non-zero".into()));
        }
        if self.retry_base > self.retry_max {
            return Err(QuiverError::Config("merge.retry_base exceeds merge.retry_max".into()));
        }
        Ok(())
    }
}
