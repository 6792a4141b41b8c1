//! The manifest: authoritative list of live parts
//!
//! Stored as JSON and replaced atomically (temp file, fsync, rename, fsync
//! directory). A part file not listed here is an orphan from an interrupted
//! flush or merge and is removed on open.

use crate::fsutil;
use crate::part::PartMeta;
use crate::{QuiverError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Manifest file name inside the data directory
pub const MANIFEST_FILE: &str = "manifest.json";

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Incremented on every commit
    pub generation: u64,
    /// Lower bound for the next part ID
    pub next_part_id: u64,
    /// Samples older than this are expired
    pub retention_cutoff: Option<Timestamp>,
    /// Wall-clock time of the last committed flush, unix milliseconds
    pub last_flush_ms: Option<i64>,
    /// Live parts, ascending by ID
    pub parts: Vec<PartMeta>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            generation: 0,
            next_part_id: 1,
            retention_cutoff: None,
            last_flush_ms: None,
            parts: Vec::new(),
        }
    }
}

impl Manifest {
    /// Load the manifest from `dir`, or `None` if there is none yet
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(dir.join(MANIFEST_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(QuiverError::InvalidFormat(format!(
                "Unsupported manifest version: {}",
                manifest.version
            )));
        }
        Ok(Some(manifest))
    }

    /// Atomically replace the manifest in `dir`
    pub fn store(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fsutil::write_atomic(&dir.join(MANIFEST_FILE), &bytes)
    }

    pub fn contains(&self, part_id: u64) -> bool {
        self.parts.iter().any(|p| p.id == part_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(id: u64) -> PartMeta {
        PartMeta {
            id,
            level: 0,
            rows: 3,
            series: 1,
            min_timestamp: 100,
            max_timestamp: 300,
            size_bytes: 512,
        }
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest {
            generation: 7,
            next_part_id: 12,
            retention_cutoff: Some(1_000),
            last_flush_ms: Some(1_700_000_000_000),
            parts: vec![meta(3), meta(11)],
            ..Default::default()
        };
        manifest.store(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.contains(11));
        assert!(!loaded.contains(4));
        assert!(!dir.path().join("manifest.tmp").exists());
    }

    #[test]
    fn test_garbage_manifest_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{not json").unwrap();
        assert!(matches!(Manifest::load(dir.path()), Err(QuiverError::InvalidFormat(_))));
    }
}
