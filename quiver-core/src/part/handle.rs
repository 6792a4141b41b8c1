//! Shared, reference-counted part handle

use super::{part_file_name, PartMeta, PartReader};
use crate::mempart::SeriesColumns;
use crate::{QuiverError, Result, SeriesId, TimeRange};
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// A live part, shared through `Arc` by the part set and every scan
///
/// The file outlives the part set entry: it is deleted (or moved to
/// quarantine) only when the last `Arc` is dropped, so a search that
/// snapshotted the part keeps reading valid data after a merge retires it.
pub struct PartHandle {
    reader: PartReader,
    quarantine_dir: PathBuf,
    in_merge: AtomicBool,
    obsolete: AtomicBool,
    quarantined: AtomicBool,
}

impl PartHandle {
    /// Open a committed part; `expected_id` comes from the manifest
    pub fn open(path: &Path, expected_id: u64, quarantine_dir: &Path) -> Result<Self> {
        let reader = PartReader::open(path)?;
        if reader.id() != expected_id {
            return Err(QuiverError::Corruption(format!(
                "Part file {:?} holds part {} instead of {}",
                path,
                reader.id(),
                expected_id
            )));
        }
        Ok(Self::from_reader(reader, quarantine_dir))
    }

    pub fn from_reader(reader: PartReader, quarantine_dir: &Path) -> Self {
        Self {
            reader,
            quarantine_dir: quarantine_dir.to_path_buf(),
            in_merge: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
            quarantined: AtomicBool::new(false),
        }
    }

    pub fn reader(&self) -> &PartReader {
        &self.reader
    }

    /// Claim the part for a merge; false if another merge already owns it
    pub fn try_claim(&self) -> bool {
        self.in_merge
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.in_merge.store(false, Ordering::Release);
    }

    pub fn is_in_merge(&self) -> bool {
        self.in_merge.load(Ordering::Acquire)
    }

    /// Delete the file once the last reference is gone
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Exclude the part from search; its file moves to quarantine once
    /// the part set and all readers have let go of it. Returns false if it
    /// was already quarantined.
    pub fn quarantine(&self, reason: &QuiverError) -> bool {
        let first = !self.quarantined.swap(true, Ordering::AcqRel);
        if first {
            error!("Quarantining part {}: {}", self.meta().id, reason);
        }
        first
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    /// Read one series; a quarantined part serves no data
    pub fn read_series(&self, series_id: SeriesId, range: &TimeRange) -> Result<Option<SeriesColumns>> {
        if self.is_quarantined() {
            return Err(QuiverError::PartQuarantined(self.meta().id));
        }
        self.reader.read_series(series_id, range)
    }
}

impl Deref for PartHandle {
    type Target = PartReader;

    fn deref(&self) -> &PartReader {
        &self.reader
    }
}

impl std::fmt::Debug for PartHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartHandle")
            .field("meta", self.meta())
            .field("in_merge", &self.is_in_merge())
            .field("obsolete", &self.is_obsolete())
            .field("quarantined", &self.is_quarantined())
            .finish()
    }
}

impl Drop for PartHandle {
    fn drop(&mut self) {
        let path = self.reader.path().to_path_buf();
        let meta: &PartMeta = self.reader.meta();

        if self.is_quarantined() {
            let target = self.quarantine_dir.join(part_file_name(meta.id));
            let moved = fs::create_dir_all(&self.quarantine_dir).and_then(|_| fs::rename(&path, &target));
            match moved {
                Ok(()) => info!("Moved part {} to {:?}", meta.id, target),
                Err(e) => warn!("Failed to move quarantined part {:?}: {}", path, e),
            }
        } else if self.is_obsolete() {
            match fs::remove_file(&path) {
                Ok(()) => info!("Deleted retired part {}", meta.id),
                Err(e) => warn!("Failed to delete retired part {:?}: {}", path, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{part_path, PartConfig, PartWriter};
    use crate::TimeRange;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write(dir: &Path, id: u64) -> PathBuf {
        let mut writer = PartWriter::create(&dir.join("tmp"), id, 0, PartConfig::default()).unwrap();
        writer.add_series(1, &[10, 20, 30], &[1.0, 2.0, 3.0]).unwrap();
        writer.finish(&dir.join("parts")).unwrap();
        part_path(&dir.join("parts"), id)
    }

    #[test]
    fn test_retired_part_outlives_readers() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), 1);
        let handle = Arc::new(PartHandle::open(&path, 1, &dir.path().join("quarantine")).unwrap());

        let scan = handle.clone();
        handle.mark_obsolete();
        drop(handle);
        assert!(path.exists());

        let cols = scan.read_series(1, &TimeRange::all()).unwrap().unwrap();
        assert_eq!(cols.values, vec![1.0, 2.0, 3.0]);
        drop(scan);
        assert!(!path.exists());
    }

    #[test]
    fn test_quarantine_moves_file() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), 2);
        let qdir = dir.path().join("quarantine");
        let handle = PartHandle::open(&path, 2, &qdir).unwrap();

        assert!(handle.read_series(1, &TimeRange::all()).unwrap().is_some());
        assert!(handle.quarantine(&QuiverError::Corruption("test".into())));
        assert!(!handle.quarantine(&QuiverError::Corruption("again".into())));
        assert!(matches!(
            handle.read_series(1, &TimeRange::all()),
            Err(QuiverError::PartQuarantined(2))
        ));
        handle.mark_obsolete();
        drop(handle);

        assert!(!path.exists());
        assert!(qdir.join(part_file_name(2)).exists());
    }

    #[test]
    fn test_claim_and_id_check() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), 3);
        assert!(PartHandle::open(&path, 4, dir.path()).is_err());

        let handle = PartHandle::open(&path, 3, dir.path()).unwrap();
        assert!(handle.try_claim());
        assert!(!handle.try_claim());
        handle.release();
        assert!(handle.try_claim());
    }
}
