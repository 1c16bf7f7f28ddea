//! SQLite-backed metadata index
//!
//! Rows are buffered in memory and written in one transaction per batch, so
//! memory stays bounded on backups with hundreds of thousands of entries.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::IndexWriteError;
use crate::metadata::MetadataRecord;

/// Rows buffered before an automatic flush
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Counters describing what reached the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub rows_appended: u64,
    pub rows_written: u64,
    pub rows_failed: u64,
    pub flushes: u64,
}

struct IndexRow {
    display_path: String,
    record: MetadataRecord,
}

/// Buffered writer for the `Metadata` table
pub struct MetadataIndexWriter {
    conn: Connection,
    db_path: PathBuf,
    batch_size: usize,
    buffer: Vec<IndexRow>,
    stats: IndexStats,
}

impl MetadataIndexWriter {
    /// Open (or create) the index database and ensure the schema exists
    ///
    /// Rows left by an earlier run are removed, so the index always holds
    /// one row per entry of the current run.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexWriteError> {
        Self::with_batch_size(path, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(
        path: impl AsRef<Path>,
        batch_size: usize,
    ) -> Result<Self, IndexWriteError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path).map_err(|source| IndexWriteError::Open {
            path: db_path.clone(),
            source,
        })?;

        let writer = Self {
            conn,
            db_path,
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            stats: IndexStats::default(),
        };
        writer.initialize_schema()?;

        tracing::debug!("Opened metadata index {}", writer.db_path.display());
        Ok(writer)
    }

    fn initialize_schema(&self) -> Result<(), IndexWriteError> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS Metadata (
                    RelativePath TEXT,
                    LastModified DATE,
                    LastStatusChange DATE,
                    Birth DATE,
                    Size INTEGER,
                    InodeNumber INTEGER,
                    Flags INTEGER,
                    UserID INTEGER,
                    GroupID INTEGER,
                    Mode INTEGER,
                    ProtectionClass INTEGER,
                    ExtendedAttributes BLOB
                );
                DELETE FROM Metadata;
                "#,
            )
            .map_err(IndexWriteError::Schema)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Rows waiting for the next flush
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    /// Buffer one row, flushing once the batch is full
    pub fn append(&mut self, record: MetadataRecord, display_path: impl Into<String>) {
        self.buffer.push(IndexRow {
            display_path: display_path.into(),
            record,
        });
        self.stats.rows_appended += 1;

        if self.buffer.len() >= self.batch_size {
            if let Err(e) = self.flush() {
                tracing::error!("Error filling Metadata table: {}", e);
            }
        }
    }

    /// Write all buffered rows in a single transaction
    ///
    /// On failure the batch is dropped and counted as failed; rows are never
    /// retried, which keeps memory bounded.
    pub fn flush(&mut self) -> Result<usize, IndexWriteError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let batch = std::mem::take(&mut self.buffer);
        let rows = batch.len();
        self.stats.flushes += 1;

        match write_batch(&mut self.conn, &batch) {
            Ok(()) => {
                self.stats.rows_written += rows as u64;
                tracing::debug!("Flushed {} metadata rows to {}", rows, self.db_path.display());
                Ok(rows)
            }
            Err(source) => {
                self.stats.rows_failed += rows as u64;
                Err(IndexWriteError::Flush { rows, source })
            }
        }
    }

    /// Flush the remainder and close the database
    pub fn finish(mut self) -> IndexStats {
        if let Err(e) = self.flush() {
            tracing::error!("Error filling Metadata table: {}", e);
        }
        self.stats
    }
}

impl Drop for MetadataIndexWriter {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            tracing::warn!(
                "Metadata index dropped with {} unflushed rows; flushing",
                self.buffer.len()
            );
            if let Err(e) = self.flush() {
                tracing::error!("Error filling Metadata table: {}", e);
            }
        }
    }
}

fn write_batch(conn: &mut Connection, batch: &[IndexRow]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            r#"
            INSERT INTO Metadata (
                RelativePath, LastModified, LastStatusChange, Birth,
                Size, InodeNumber, Flags, UserID, GroupID,
                Mode, ProtectionClass, ExtendedAttributes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )?;
        for row in batch {
            let record = &row.record;
            stmt.execute(params![
                row.display_path,
                record.last_modified.map(format_timestamp),
                record.last_status_change.map(format_timestamp),
                record.birth.map(format_timestamp),
                record.size.and_then(|size| i64::try_from(size).ok()),
                record.inode_number.and_then(|inode| i64::try_from(inode).ok()),
                record.flags,
                record.user_id,
                record.group_id,
                record.mode,
                record.protection_class,
                record.extended_attributes,
            ])?;
        }
    }
    tx.commit()
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
