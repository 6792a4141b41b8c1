//! Immutable on-disk parts
//!
//! A part is a single file holding per-series column blocks for a closed
//! time interval:
//!
//! ```text
//! header   magic "QPRT" | version u32 | part id u64            (16 bytes)
//! blocks   one or more per series, ascending (series id, first timestamp)
//! index    block count u32 | entries | crc32
//! bitmap   roaring bitmap of series ids | crc32
//! footer   index offset, index len, bitmap offset, bitmap len,
//!          rows, series u64 | min ts, max ts i64 | level u32
//!          | crc32 of the preceding 68 bytes | magic "QPRT"  (76 bytes)
//! ```
//!
//! Parts are written under `tmp/`, fsynced, then renamed into `parts/`.
//! They only become live once listed in the manifest.

mod block;
mod handle;
mod reader;
mod writer;

pub use block::{Block, BlockRef};
pub use handle::PartHandle;
pub use reader::PartReader;
pub use writer::PartWriter;

use crate::compression::BlockCompression;
use crate::{TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Part file format version
pub const FORMAT_VERSION: u32 = 1;

pub(crate) const MAGIC: &[u8; 4] = b"QPRT";

/// File extension of part files
pub const PART_EXTENSION: &str = "part";

/// Part metadata, mirrored in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMeta {
    /// Unique, monotonically allocated ID
    pub id: u64,
    /// 0 for flushed parts, one more than the deepest input for merged parts
    pub level: u32,
    /// Stored rows after dedup
    pub rows: u64,
    /// Distinct series
    pub series: u64,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    /// File size in bytes
    pub size_bytes: u64,
}

impl PartMeta {
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.min_timestamp, self.max_timestamp)
    }

    /// Check if the part may contain data in the range
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.rows > 0 && self.time_range().overlaps(range)
    }
}

/// Part writer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartConfig {
    /// Maximum samples per block
    pub max_rows_per_block: usize,
    /// Block compression
    pub compression: BlockCompression,
}

impl Default for PartConfig {
    fn default() -> Self {
        Self {
            max_rows_per_block: crate::config::MAX_ROWS_PER_BLOCK,
            compression: BlockCompression::Lz4,
        }
    }
}

/// File name of a part
pub fn part_file_name(id: u64) -> String {
    format!("{:016x}.{}", id, PART_EXTENSION)
}

/// Path of a part inside `dir`
pub fn part_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(part_file_name(id))
}

/// Parse a part ID back out of its file name
pub fn parse_part_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(PART_EXTENSION)?.strip_suffix('.')?;
    u64::from_str_radix(stem, 16).ok()
}
