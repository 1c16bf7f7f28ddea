//! Manifest index: the row source listing every backed-up entry

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// What kind of filesystem object a manifest row describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    /// Any other type code; not produced by modern backups
    Other(i64),
}

impl EntryKind {
    pub fn from_flags(flags: i64) -> Self {
        match flags {
            1 => EntryKind::File,
            2 => EntryKind::Directory,
            other => EntryKind::Other(other),
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::File => write!(f, "file"),
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::Other(code) => write!(f, "type {}", code),
        }
    }
}

/// One row of the manifest index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    /// Content-store key
    pub identifier: String,
    pub domain: String,
    /// Empty when the entry is the domain root itself
    pub relative_path: String,
    pub kind: EntryKind,
    /// Serialized keyed-archive metadata
    pub metadata: Vec<u8>,
}

impl BackupEntry {
    /// `domain/relativePath`, or just the domain for a domain root
    pub fn display_path(&self) -> String {
        if self.relative_path.is_empty() {
            self.domain.clone()
        } else {
            format!("{}/{}", self.domain, self.relative_path)
        }
    }
}

/// Read-only handle on a `Manifest.db` file
pub struct ManifestDb {
    conn: Connection,
    db_path: PathBuf,
}

const ENTRY_QUERY: &str = "SELECT fileID, domain, relativePath, flags, file FROM Files";

impl ManifestDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| ManifestError::Open {
            path: db_path.clone(),
            source,
        })?;

        tracing::debug!("Opened database: {} successfully", db_path.display());
        Ok(Self { conn, db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Number of rows in the Files table
    pub fn count(&self) -> Result<u64, ManifestError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM Files", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Stream every entry through `visit` without loading the table into memory
    ///
    /// The iterator only lives for the duration of the closure because it
    /// borrows the prepared statement.
    pub fn with_entries<R>(
        &self,
        visit: impl FnOnce(&mut dyn Iterator<Item = Result<BackupEntry, ManifestError>>) -> R,
    ) -> Result<R, ManifestError> {
        tracing::debug!(
            "Trying to execute query: {} against database {}",
            ENTRY_QUERY,
            self.db_path.display()
        );
        let mut stmt = self.conn.prepare(ENTRY_QUERY)?;
        let rows = stmt.query_map([], entry_from_row)?;
        tracing::debug!(
            "Successfully executed query: {} against database {}",
            ENTRY_QUERY,
            self.db_path.display()
        );

        let mut entries = rows.map(|row| row.map_err(ManifestError::from));
        let result = visit(&mut entries);
        Ok(result)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<BackupEntry> {
    let identifier: String = row.get(0)?;
    let domain: Option<String> = row.get(1)?;
    let relative_path: Option<String> = row.get(2)?;
    let flags: Option<i64> = row.get(3)?;
    let metadata: Option<Vec<u8>> = row.get(4)?;

    Ok(BackupEntry {
        identifier,
        domain: domain.unwrap_or_default(),
        relative_path: relative_path.unwrap_or_default(),
        kind: EntryKind::from_flags(flags.unwrap_or(0)),
        metadata: metadata.unwrap_or_default(),
    })
}
