//! Filesystem snapshots
//!
//! A snapshot is a directory with the same layout as a data directory:
//! hard links to every live part file, a copy of the manifest and a copy of
//! the series log. Opening an engine on it restores the data as of the
//! snapshot.

use super::{Layout, Manifest};
use crate::index::IndexDb;
use crate::part::{part_file_name, PartHandle};
use crate::{QuiverError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NAME_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Snapshots directory inside the data directory
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// `<YYYYMMDDhhmmss>-<seq as 16 hex digits>`
pub(crate) fn new_name(seq: u64) -> String {
    format!("{}-{:016X}", Utc::now().format(NAME_TIME_FORMAT), seq)
}

/// Whether `name` could have been produced by [`new_name`]
pub(crate) fn is_valid_name(name: &str) -> bool {
    let Some((stamp, seq)) = name.split_once('-') else {
        return false;
    };
    stamp.len() == 14
        && stamp.bytes().all(|b| b.is_ascii_digit())
        && seq.len() == 16
        && seq.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Creation time encoded in a snapshot name
pub(crate) fn created_at(name: &str) -> Option<DateTime<Utc>> {
    let (stamp, _) = name.split_once('-')?;
    let naive = NaiveDateTime::parse_from_str(stamp, NAME_TIME_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Materialize a snapshot of `parts` and `manifest` into `snapshots_dir/name`
pub(crate) fn create(
    snapshots_dir: &Path,
    name: &str,
    parts: &[Arc<PartHandle>],
    manifest: &Manifest,
    index: &IndexDb,
) -> Result<PathBuf> {
    let target = snapshots_dir.join(name);
    if target.exists() {
        return Err(QuiverError::Internal(format!("snapshot {} already exists", name)));
    }

    let result = populate(&target, parts, manifest, index);
    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_dir_all(&target) {
            warn!("Failed to remove partial snapshot {:?}: {}", target, cleanup);
        }
        return Err(e);
    }

    info!("Created snapshot {} with {} parts", name, parts.len());
    Ok(target)
}

fn populate(target: &Path, parts: &[Arc<PartHandle>], manifest: &Manifest, index: &IndexDb) -> Result<()> {
    let layout = Layout::new(target);
    fs::create_dir_all(&layout.parts)?;
    fs::create_dir_all(&layout.index)?;

    for part in parts {
        fs::hard_link(part.path(), layout.parts.join(part_file_name(part.id())))?;
    }
    index.snapshot_to(&layout.index)?;
    manifest.store(&layout.root)?;
    crate::fsutil::sync_dir(&layout.parts)?;
    crate::fsutil::sync_parent(&layout.parts)
}

/// Snapshot names, oldest first
pub(crate) fn list(snapshots_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !snapshots_dir.exists() {
        return Ok(names);
    }
    for entry in fs::read_dir(snapshots_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_valid_name(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

pub(crate) fn delete(snapshots_dir: &Path, name: &str) -> Result<()> {
    let path = snapshots_dir.join(name);
    if !is_valid_name(name) || !path.is_dir() {
        return Err(QuiverError::SnapshotNotFound(name.to_string()));
    }
    fs::remove_dir_all(&path)?;
    info!("Deleted snapshot {}", name);
    Ok(())
}

/// Delete snapshots created more than `max_age` before `now`; returns
/// their names, oldest first
pub(crate) fn delete_stale(snapshots_dir: &Path, max_age: Duration, now: DateTime<Utc>) -> Result<Vec<String>> {
    let max_age = chrono::Duration::from_std(max_age)
        .map_err(|e| QuiverError::Config(format!("invalid snapshot max age: {}", e)))?;
    let mut deleted = Vec::new();
    for name in list(snapshots_dir)? {
        let Some(created) = created_at(&name) else {
            warn!("Skipping snapshot {} with unreadable creation time", name);
            continue;
        };
        if now - created > max_age {
            delete(snapshots_dir, &name)?;
            deleted.push(name);
        }
    }
    if !deleted.is_empty() {
        info!("Deleted {} stale snapshots", deleted.len());
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_names() {
        let name = new_name(42);
        assert!(is_valid_name(&name), "{}", name);
        assert!(name.ends_with("-000000000000002A"));

        assert!(!is_valid_name("../../etc"));
        assert!(!is_valid_name("20240101000000-xyz"));
        assert!(!is_valid_name("2024-000000000000002A"));
    }

    #[test]
    fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let snapshots = dir.path().join(SNAPSHOTS_DIR);
        assert!(list(&snapshots).unwrap().is_empty());

        for name in ["20240102000000-0000000000000002", "20240101000000-0000000000000001"] {
            fs::create_dir_all(snapshots.join(name)).unwrap();
        }
        fs::create_dir_all(snapshots.join("scratch")).unwrap();

        assert_eq!(
            list(&snapshots).unwrap(),
            vec!["20240101000000-0000000000000001", "20240102000000-0000000000000002"]
        );

        delete(&snapshots, "20240101000000-0000000000000001").unwrap();
        assert!(matches!(
            delete(&snapshots, "20240101000000-0000000000000001"),
            Err(QuiverError::SnapshotNotFound(_))
        ));
        assert!(matches!(delete(&snapshots, "scratch"), Err(QuiverError::SnapshotNotFound(_))));
        assert_eq!(list(&snapshots).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_stale() {
        let dir = TempDir::new().unwrap();
        let snapshots = dir.path().join(SNAPSHOTS_DIR);
        let names = [
            "20240101000000-0000000000000001",
            "20240109000000-0000000000000002",
            "20240110113000-0000000000000003",
            "20241399000000-0000000000000004",
        ];
        for name in names {
            fs::create_dir_all(snapshots.join(name)).unwrap();
        }
        assert_eq!(
            created_at(names[1]),
            Some(Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap())
        );
        assert_eq!(created_at(names[3]), None);

        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let two_days = Duration::from_secs(2 * 24 * 3600);
        assert_eq!(delete_stale(&snapshots, two_days, now).unwrap(), vec![names[0]]);

        let one_hour = Duration::from_secs(3600);
        assert_eq!(delete_stale(&snapshots, one_hour, now).unwrap(), vec![names[1]]);
        assert_eq!(list(&snapshots).unwrap(), vec![names[2], names[3]]);
    }
}
