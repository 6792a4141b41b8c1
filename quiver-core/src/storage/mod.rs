//! Storage engine - coordinates all storage components

mod engine;
mod manifest;
mod partset;
mod snapshot;

pub use engine::{Durability, Engine, EngineStats, PushSummary, RetentionReport};
pub use manifest::{Manifest, MANIFEST_FILE};
pub use partset::PartSet;
pub use snapshot::SNAPSHOTS_DIR;

use crate::index::{IndexConfig, SyncPolicy};
use crate::mempart::{MemPartConfig, OutOfOrderPolicy};
use crate::merge::MergeConfig;
use crate::part::PartConfig;
use crate::{QuiverError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// Ingestion buffer
    pub mempart: MemPartConfig,
    /// Part file layout
    pub part: PartConfig,
    /// Background merging
    pub merge: MergeConfig,
    /// Label index
    pub index: IndexConfig,
    /// Keep one sample per series and window of this many milliseconds;
    /// 0 keeps every distinct timestamp
    pub dedup_interval_ms: i64,
    /// Default series limit of a single search
    pub max_series_per_search: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            mempart: MemPartConfig::default(),
            part: PartConfig::default(),
            merge: MergeConfig::default(),
            index: IndexConfig::default(),
            dedup_interval_ms: 0,
            max_series_per_search: crate::config::MAX_SERIES_PER_SEARCH,
        }
    }
}

impl StorageConfig {
    /// Default configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(QuiverError::Config("data_dir must not be empty".into()));
        }
        if self.index.shards == 0 {
            return Err(QuiverError::Config("index.shards must be at least 1".into()));
        }
        if self.index.sync_policy == SyncPolicy::EveryN(0) {
            return Err(QuiverError::Config("index.sync_policy EveryN needs N >= 1".into()));
        }
        if self.mempart.max_rows == 0 || self.mempart.max_bytes == 0 {
            return Err(QuiverError::Config(
                "mempart.max_rows and mempart.max_bytes must be non-zero".into(),
            ));
        }
        if let OutOfOrderPolicy::Reject { tolerance_ms } = self.mempart.out_of_order {
            if tolerance_ms < 0 {
                return Err(QuiverError::Config(
                    "mempart out-of-order tolerance must not be negative".into(),
                ));
            }
        }
        if self.part.max_rows_per_block == 0 || self.part.max_rows_per_block > u32::MAX as usize {
            return Err(QuiverError::Config(format!(
                "part.max_rows_per_block must be in 1..={}",
                u32::MAX
            )));
        }
        if self.dedup_interval_ms < 0 {
            return Err(QuiverError::Config("dedup_interval_ms must not be negative".into()));
        }
        if self.max_series_per_search == 0 {
            return Err(QuiverError::Config("max_series_per_search must be at least 1".into()));
        }
        self.merge.validate()
    }
}

/// Directory layout under the data directory
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    pub root: PathBuf,
    pub parts: PathBuf,
    pub tmp: PathBuf,
    pub quarantine: PathBuf,
    pub index: PathBuf,
    pub snapshots: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            parts: root.join("parts"),
            tmp: root.join("tmp"),
            quarantine: root.join("quarantine"),
            index: root.join("index"),
            snapshots: root.join(SNAPSHOTS_DIR),
        }
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [&self.root, &self.parts, &self.tmp, &self.quarantine, &self.index, &self.snapshots] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
