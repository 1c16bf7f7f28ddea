//! Filesystem actions for a single manifest entry

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};

use super::paths::{content_store_path, destination_path};
use crate::error::ReconstructionError;
use crate::manifest::BackupEntry;
use crate::metadata::MetadataRecord;

/// Result of the best-effort timestamp restoration after a copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampOutcome {
    Restored,
    /// The record carried neither an access nor a modification time
    Skipped,
    /// Logged and counted, never propagated
    Failed(String),
}

/// What happened to one entry
#[derive(Debug)]
pub enum EntryOutcome {
    DirectoryCreated(PathBuf),
    FileCopied {
        destination: PathBuf,
        bytes: u64,
        timestamps: TimestampOutcome,
    },
    Unsupported {
        code: i64,
        blob_present: bool,
    },
    Failed(ReconstructionError),
}

impl EntryOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, EntryOutcome::Failed(_))
    }
}

/// Create the entry's directory and any missing ancestors
///
/// An existing directory (including one created concurrently) is success.
pub fn recreate_directory(
    destination_root: &Path,
    entry: &BackupEntry,
) -> Result<PathBuf, ReconstructionError> {
    let path = destination_path(destination_root, &entry.domain, &entry.relative_path);
    create_dir_all(&path)?;
    Ok(path)
}

/// Copy the entry's blob from the content store to its original path
pub fn recreate_file(
    content_root: &Path,
    destination_root: &Path,
    entry: &BackupEntry,
    record: &MetadataRecord,
) -> Result<(PathBuf, u64, TimestampOutcome), ReconstructionError> {
    let source = content_store_path(content_root, &entry.identifier)?;
    let destination = destination_path(destination_root, &entry.domain, &entry.relative_path);

    if !source.is_file() {
        return Err(ReconstructionError::MissingSource(source));
    }
    if let Some(parent) = destination.parent() {
        create_dir_all(parent)?;
    }

    tracing::debug!(
        "Trying to copy {} to {}",
        source.display(),
        destination.display()
    );
    let bytes = copy_contents(&source, &destination).map_err(|source_err| {
        ReconstructionError::Copy {
            from: source.clone(),
            to: destination.clone(),
            source: source_err,
        }
    })?;
    tracing::debug!(
        "Successfully copied {} to {}",
        source.display(),
        destination.display()
    );

    let timestamps = restore_timestamps(&destination, record);
    if let TimestampOutcome::Failed(reason) = &timestamps {
        tracing::debug!(
            "Could not restore timestamps on {}: {}",
            destination.display(),
            reason
        );
    }

    Ok((destination, bytes, timestamps))
}

/// Whether a blob exists for an entry of an unsupported type
pub fn unsupported_blob_present(content_root: &Path, entry: &BackupEntry) -> bool {
    content_store_path(content_root, &entry.identifier)
        .map(|path| path.is_file())
        .unwrap_or(false)
}

/// Set access time from LastStatusChange and modification time from LastModified
///
/// Times are set by path, so a destination without write permission still
/// gets them.
pub fn restore_timestamps(path: &Path, record: &MetadataRecord) -> TimestampOutcome {
    let accessed = record.last_status_change.map(to_file_time);
    let modified = record.last_modified.map(to_file_time);

    let result = match (accessed, modified) {
        (None, None) => return TimestampOutcome::Skipped,
        (Some(atime), Some(mtime)) => filetime::set_file_times(path, atime, mtime),
        (Some(atime), None) => filetime::set_file_atime(path, atime),
        (None, Some(mtime)) => filetime::set_file_mtime(path, mtime),
    };
    match result {
        Ok(()) => TimestampOutcome::Restored,
        Err(e) => TimestampOutcome::Failed(e.to_string()),
    }
}

fn to_file_time(timestamp: DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(timestamp.timestamp(), timestamp.timestamp_subsec_nanos())
}

// Contents only: the blob's permission bits are not carried over, so a
// read-only store still yields writable copies. A read-only copy left by an
// earlier run is replaced rather than truncated.
fn copy_contents(source: &Path, destination: &Path) -> io::Result<u64> {
    if let Ok(existing) = fs::symlink_metadata(destination) {
        if existing.is_file() && existing.permissions().readonly() {
            fs::remove_file(destination)?;
        }
    }
    let mut reader = File::open(source)?;
    let mut writer = File::create(destination)?;
    io::copy(&mut reader, &mut writer)
}

fn create_dir_all(path: &Path) -> Result<(), ReconstructionError> {
    fs::create_dir_all(path).map_err(|source| ReconstructionError::CreateDirectory {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::EntryKind;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn entry(identifier: &str, relative_path: &str, kind: EntryKind) -> BackupEntry {
        BackupEntry {
            identifier: identifier.to_string(),
            domain: "AppDomain".to_string(),
            relative_path: relative_path.to_string(),
            kind,
            metadata: Vec::new(),
        }
    }

    fn store_blob(content_root: &Path, identifier: &str, bytes: &[u8]) {
        let shard = content_root.join(&identifier[..2]);
        fs::create_dir_all(&shard).unwrap();
        fs::write(shard.join(identifier), bytes).unwrap();
    }

    #[test]
    fn test_directory_recreation_is_idempotent() {
        let out = TempDir::new().unwrap();
        let dir = entry("dd00", "Library/Caches", EntryKind::Directory);

        let first = recreate_directory(out.path(), &dir).unwrap();
        let second = recreate_directory(out.path(), &dir).unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert_eq!(fs::read_dir(first.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_file_copy_restores_timestamps() {
        let store = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        store_blob(store.path(), "ab12ef", b"hello");

        let record = MetadataRecord {
            last_modified: DateTime::from_timestamp(1_000_000_000, 0),
            last_status_change: DateTime::from_timestamp(1_000_000_100, 0),
            ..Default::default()
        };
        let file = entry("ab12ef", "Documents/note.txt", EntryKind::File);
        let (destination, bytes, timestamps) =
            recreate_file(store.path(), out.path(), &file, &record).unwrap();

        assert_eq!(bytes, 5);
        assert_eq!(timestamps, TimestampOutcome::Restored);
        assert_eq!(fs::read(&destination).unwrap(), b"hello");
        let modified = fs::metadata(&destination).unwrap().modified().unwrap();
        assert_eq!(
            modified,
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000_000)
        );
    }

    #[test]
    fn test_copying_twice_overwrites_without_duplicates() {
        let store = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        store_blob(store.path(), "ab12ef", b"hello");

        let file = entry("ab12ef", "note.txt", EntryKind::File);
        let record = MetadataRecord::default();
        recreate_file(store.path(), out.path(), &file, &record).unwrap();
        let (destination, _, timestamps) =
            recreate_file(store.path(), out.path(), &file, &record).unwrap();

        assert_eq!(timestamps, TimestampOutcome::Skipped);
        assert_eq!(fs::read(destination).unwrap(), b"hello");
        assert_eq!(fs::read_dir(out.path().join("AppDomain")).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_blob_copies_twice_with_timestamps() {
        use std::os::unix::fs::PermissionsExt;

        let store = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        store_blob(store.path(), "ab12ef", b"evidence");
        let blob = store.path().join("ab").join("ab12ef");
        fs::set_permissions(&blob, fs::Permissions::from_mode(0o444)).unwrap();

        let record = MetadataRecord {
            last_modified: DateTime::from_timestamp(1_000_000_000, 0),
            last_status_change: DateTime::from_timestamp(1_000_000_100, 0),
            ..Default::default()
        };
        let file = entry("ab12ef", "Documents/evidence.bin", EntryKind::File);

        for _ in 0..2 {
            let (destination, bytes, timestamps) =
                recreate_file(store.path(), out.path(), &file, &record).unwrap();
            assert_eq!(bytes, 8);
            assert_eq!(timestamps, TimestampOutcome::Restored);
            assert_eq!(fs::read(&destination).unwrap(), b"evidence");
            let metadata = fs::metadata(&destination).unwrap();
            assert!(!metadata.permissions().readonly());
            assert_eq!(
                metadata.modified().unwrap(),
                SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000_000)
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_copy_from_earlier_run_is_replaced() {
        use std::os::unix::fs::PermissionsExt;

        let store = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        store_blob(store.path(), "ab12ef", b"fresh");
        let file = entry("ab12ef", "stale.txt", EntryKind::File);
        let stale = out.path().join("AppDomain").join("stale.txt");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"old contents").unwrap();
        fs::set_permissions(&stale, fs::Permissions::from_mode(0o444)).unwrap();

        let (destination, bytes, _) =
            recreate_file(store.path(), out.path(), &file, &MetadataRecord::default()).unwrap();
        assert_eq!(destination, stale);
        assert_eq!(bytes, 5);
        assert_eq!(fs::read(&destination).unwrap(), b"fresh");
    }

    #[test]
    fn test_missing_source_is_reported() {
        let store = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let file = entry("ffee00", "gone.txt", EntryKind::File);

        let err = recreate_file(store.path(), out.path(), &file, &MetadataRecord::default())
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::MissingSource(_)));
    }

    #[test]
    fn test_timestamp_failure_is_reported_not_raised() {
        let out = TempDir::new().unwrap();
        let record = MetadataRecord {
            last_modified: DateTime::from_timestamp(1_000_000_000, 0),
            ..Default::default()
        };
        let outcome = restore_timestamps(&out.path().join("does-not-exist"), &record);
        assert!(matches!(outcome, TimestampOutcome::Failed(_)));
    }

    #[test]
    fn test_unsupported_entry_blob_presence() {
        let store = TempDir::new().unwrap();
        store_blob(store.path(), "cc3344", b"x");

        assert!(unsupported_blob_present(
            store.path(),
            &entry("cc3344", "link", EntryKind::Other(4))
        ));
        assert!(!unsupported_blob_present(
            store.path(),
            &entry("dd5566", "link", EntryKind::Other(4))
        ));
    }
}
