//! QuiverDB Core - Label-Indexed Time-Series Storage Engine
//!
//! QuiverDB stores numeric samples of series identified by label sets and
//! answers label-matcher plus time-range searches over them.
//!
//! # Architecture
//!
//! - **IndexDB**: label postings, series identity and the per-day index,
//!   persisted through an append-only series log
//! - **MemPart**: in-memory ingestion buffer, keyed by series ID
//! - **Parts**: immutable columnar files with per-block checksums
//! - **Merge scheduler**: background size-tiered merging and retention
//! - **Search**: snapshot-isolated, lazy streaming of matching samples
//!
//! The [`Engine`] ties these together:
//!
//! ```no_run
//! use quiver_core::{Engine, Labels, Matcher, MetricRow, StorageConfig, TimeRange};
//!
//! # fn main() -> quiver_core::Result<()> {
//! let engine = Engine::open(StorageConfig::new("data"))?;
//! let labels = Labels::from_pairs([("__name__", "cpu"), ("host", "a")]);
//! engine.push_batch(&[MetricRow::new(labels, 1_000, 0.5)])?;
//!
//! let matchers = [Matcher::equal("host", "a")?];
//! for sample in engine.search(&matchers, TimeRange::new(0, 2_000))? {
//!     let sample = sample?;
//!     println!("{} {} {}", sample.series_id, sample.timestamp, sample.value);
//! }
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod index;
pub mod mempart;
pub mod merge;
pub mod part;
pub mod search;
pub mod storage;

mod error;
mod fsutil;
mod types;

pub use error::{QuiverError, Result};
pub use index::{IndexDb, MatchOp, Matcher};
pub use search::{SearchIter, SearchOptions};
pub use storage::{Durability, Engine, EngineStats, PushSummary, StorageConfig};
pub use types::*;

/// QuiverDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Postings and series map shards
    pub const INDEX_SHARDS: usize = 16;

    /// How far behind a series' newest sample a new sample may be (1 minute)
    pub const OUT_OF_ORDER_TOLERANCE_MS: i64 = 60_000;

    /// MemPart row limit before flush
    pub const MEMPART_MAX_ROWS: usize = 1_000_000;

    /// MemPart size limit before flush (64MB)
    pub const MEMPART_MAX_BYTES: usize = 64 * 1024 * 1024;

    /// MemPart age limit before flush
    pub const MEMPART_MAX_AGE: Duration = Duration::from_secs(5);

    /// Samples per column block
    pub const MAX_ROWS_PER_BLOCK: usize = 8 * 1024;

    /// Background merge workers
    pub const MERGE_WORKERS: usize = 2;

    /// Pending merge jobs
    pub const MERGE_QUEUE_CAPACITY: usize = 16;

    /// Parts per size tier before it is merged
    pub const MAX_PARTS_PER_TIER: usize = 8;

    /// Input parts per merge
    pub const MAX_MERGE_FANIN: usize = 16;

    /// Upper bound of the smallest size tier (4MB)
    pub const TIER_BASE_BYTES: u64 = 4 * 1024 * 1024;

    /// Size ratio between tiers
    pub const TIER_RATIO: u64 = 8;

    /// Total input size per merge (4GB)
    pub const MAX_MERGE_OUTPUT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

    /// Maintenance tick
    pub const MERGE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

    /// Series one search may touch
    pub const MAX_SERIES_PER_SEARCH: usize = 1_000_000;
}
