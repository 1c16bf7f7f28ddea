//! Reconstruction pipeline
//!
//! For every manifest row: decode the metadata blob, recreate the entry at
//! its original path, then hand the record to the metadata index. Failures
//! are isolated per entry; only setup problems abort a run.

pub mod entry;
pub mod paths;

pub use entry::{EntryOutcome, TimestampOutcome};
pub use paths::{content_store_path, destination_path, sanitize_component, sanitize_relative_path};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::archive::{ConversionTable, ResolverConfig};
use crate::error::{ManifestError, SetupError};
use crate::index::{IndexStats, MetadataIndexWriter, DEFAULT_BATCH_SIZE};
use crate::manifest::{BackupEntry, EntryKind};
use crate::metadata::{MetadataRecord, MetadataRecordDecoder};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct RecreateConfig {
    /// Index rows buffered before a flush
    pub batch_size: usize,
    pub resolver: ResolverConfig,
    pub conversions: ConversionTable,
    /// Worker threads for decode and copy; 1 runs everything on the caller's thread
    pub workers: usize,
    /// Manifest rows handed to the worker pool at a time
    pub chunk_size: usize,
}

impl Default for RecreateConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            resolver: ResolverConfig::default(),
            conversions: ConversionTable::default(),
            workers: 1,
            chunk_size: 1024,
        }
    }
}

/// Progress snapshot passed to the progress callback
#[derive(Debug, Clone)]
pub struct RecreateProgress {
    pub entries_processed: u64,
    pub total_entries: Option<u64>,
    pub failures: u64,
    pub current_path: String,
}

/// Counters reported at the end of every run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub entries_processed: u64,
    pub directories_created: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub unsupported_entries: u64,
    pub decode_failures: u64,
    pub reconstruction_failures: u64,
    pub timestamp_failures: u64,
    pub manifest_row_failures: u64,
    pub index: IndexStats,
    pub cancelled: bool,
}

impl RunSummary {
    /// Entries that hit any error (decode, reconstruction or manifest read)
    pub fn entries_with_errors(&self) -> u64 {
        self.reconstruction_failures + self.manifest_row_failures + self.decode_failures
    }

    fn record(&mut self, processed: &ProcessedEntry) {
        self.entries_processed += 1;
        if processed.decode_failed {
            self.decode_failures += 1;
        }
        match &processed.outcome {
            EntryOutcome::DirectoryCreated(_) => self.directories_created += 1,
            EntryOutcome::FileCopied {
                bytes, timestamps, ..
            } => {
                self.files_copied += 1;
                self.bytes_copied += bytes;
                if matches!(timestamps, TimestampOutcome::Failed(_)) {
                    self.timestamp_failures += 1;
                }
            }
            EntryOutcome::Unsupported { .. } => self.unsupported_entries += 1,
            EntryOutcome::Failed(_) => self.reconstruction_failures += 1,
        }
    }
}

/// One entry after decoding and recreation
#[derive(Debug)]
pub struct ProcessedEntry {
    pub display_path: String,
    pub record: MetadataRecord,
    pub decode_failed: bool,
    pub outcome: EntryOutcome,
}

type ProgressCallback = Box<dyn Fn(&RecreateProgress) + Send + Sync>;

/// Drives recreation of a whole manifest
pub struct Recreator {
    content_root: PathBuf,
    destination_root: PathBuf,
    config: RecreateConfig,
    decoder: MetadataRecordDecoder,
    total_entries: Option<u64>,
    cancel_flag: Option<Arc<AtomicBool>>,
    progress_callback: Option<ProgressCallback>,
}

impl Recreator {
    pub fn new(
        content_root: impl Into<PathBuf>,
        destination_root: impl Into<PathBuf>,
        config: RecreateConfig,
    ) -> Self {
        let decoder = MetadataRecordDecoder::new(config.conversions, config.resolver);
        Self {
            content_root: content_root.into(),
            destination_root: destination_root.into(),
            config,
            decoder,
            total_entries: None,
            cancel_flag: None,
            progress_callback: None,
        }
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(&RecreateProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Checked before each entry starts, on every worker; a set flag ends the
    /// run early
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel_flag = Some(flag);
    }

    /// Total row count, reported through progress snapshots
    pub fn set_total_entries(&mut self, total: u64) {
        self.total_entries = Some(total);
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn config(&self) -> &RecreateConfig {
        &self.config
    }

    /// Create the destination root; fatal if it cannot be created
    pub fn prepare(&self) -> Result<(), SetupError> {
        std::fs::create_dir_all(&self.destination_root).map_err(|source| {
            SetupError::Destination {
                path: self.destination_root.clone(),
                source,
            }
        })
    }

    /// Recreate every entry and index its metadata
    ///
    /// The index writer is consumed and finished exactly once, whether the
    /// run completes, is cancelled or fails during setup.
    pub fn run<I>(&self, entries: I, index: MetadataIndexWriter) -> Result<RunSummary, SetupError>
    where
        I: IntoIterator<Item = Result<BackupEntry, ManifestError>>,
    {
        self.prepare()?;
        tracing::info!(
            "Recreating file structure under {} ({} worker(s))",
            self.destination_root.display(),
            self.config.workers.max(1)
        );

        let mut index = index;
        let mut summary = RunSummary::default();
        if self.config.workers <= 1 {
            self.run_sequential(entries, &mut index, &mut summary);
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.workers)
                .build()?;
            self.run_parallel(entries, &pool, &mut index, &mut summary);
        }

        summary.index = index.finish();
        tracing::info!(
            "Recreation complete: {} entries processed, {} directories, {} files, {} with errors",
            summary.entries_processed,
            summary.directories_created,
            summary.files_copied,
            summary.entries_with_errors()
        );
        Ok(summary)
    }

    fn run_sequential<I>(&self, entries: I, index: &mut MetadataIndexWriter, summary: &mut RunSummary)
    where
        I: IntoIterator<Item = Result<BackupEntry, ManifestError>>,
    {
        for row in entries {
            if self.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            match row {
                Ok(entry) => {
                    let processed = self.process_entry(&entry);
                    self.commit(processed, index, summary);
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable manifest row: {}", e);
                    summary.manifest_row_failures += 1;
                }
            }
        }
    }

    fn run_parallel<I>(
        &self,
        entries: I,
        pool: &rayon::ThreadPool,
        index: &mut MetadataIndexWriter,
        summary: &mut RunSummary,
    ) where
        I: IntoIterator<Item = Result<BackupEntry, ManifestError>>,
    {
        let chunk_size = self.config.chunk_size.max(1);
        let mut rows = entries.into_iter();
        let mut chunk = Vec::with_capacity(chunk_size);

        loop {
            chunk.clear();
            for row in rows.by_ref() {
                match row {
                    Ok(entry) => chunk.push(entry),
                    Err(e) => {
                        tracing::warn!("Skipping unreadable manifest row: {}", e);
                        summary.manifest_row_failures += 1;
                    }
                }
                if chunk.len() == chunk_size {
                    break;
                }
            }
            if chunk.is_empty() {
                break;
            }

            // Results come back in manifest order and are indexed on this thread only.
            // Entries not yet started when the flag is raised are skipped.
            let processed: Vec<Option<ProcessedEntry>> = pool.install(|| {
                chunk
                    .par_iter()
                    .map(|entry| (!self.is_cancelled()).then(|| self.process_entry(entry)))
                    .collect()
            });
            let mut skipped = false;
            for entry in processed {
                match entry {
                    Some(entry) => self.commit(entry, index, summary),
                    None => skipped = true,
                }
            }
            if skipped {
                summary.cancelled = true;
                break;
            }
        }
    }

    fn commit(
        &self,
        processed: ProcessedEntry,
        index: &mut MetadataIndexWriter,
        summary: &mut RunSummary,
    ) {
        summary.record(&processed);
        if let Some(callback) = &self.progress_callback {
            callback(&RecreateProgress {
                entries_processed: summary.entries_processed,
                total_entries: self.total_entries,
                failures: summary.entries_with_errors(),
                current_path: processed.display_path.clone(),
            });
        }
        index.append(processed.record, processed.display_path);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Decode and recreate one entry; never fails, failures are in the outcome
    pub fn process_entry(&self, entry: &BackupEntry) -> ProcessedEntry {
        let display_path = entry.display_path();
        let (record, decode_error) = self.decoder.decode_lenient(&entry.metadata);
        if let Some(e) = &decode_error {
            tracing::warn!(
                "Continuing {} ({}) with an empty metadata record: {}",
                display_path,
                entry.identifier,
                e
            );
        }

        let outcome = match entry.kind {
            EntryKind::Directory => {
                tracing::debug!(
                    "Trying to recreate directory: {} from source file: {}",
                    display_path,
                    entry.identifier
                );
                match entry::recreate_directory(&self.destination_root, entry) {
                    Ok(path) => {
                        tracing::debug!(
                            "Successfully recreated directory: {} from source file: {}",
                            display_path,
                            entry.identifier
                        );
                        EntryOutcome::DirectoryCreated(path)
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to recreate directory: {} from source file: {}: {}",
                            display_path,
                            entry.identifier,
                            e
                        );
                        EntryOutcome::Failed(e)
                    }
                }
            }
            EntryKind::File => {
                tracing::debug!(
                    "Trying to recreate file: {} from source file: {}",
                    display_path,
                    entry.identifier
                );
                match entry::recreate_file(&self.content_root, &self.destination_root, entry, &record)
                {
                    Ok((destination, bytes, timestamps)) => {
                        tracing::debug!(
                            "Successfully recreated file: {} from source file: {}",
                            display_path,
                            entry.identifier
                        );
                        EntryOutcome::FileCopied {
                            destination,
                            bytes,
                            timestamps,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to recreate file: {} from source file: {}: {}",
                            display_path,
                            entry.identifier,
                            e
                        );
                        EntryOutcome::Failed(e)
                    }
                }
            }
            EntryKind::Other(code) => {
                let blob_present = entry::unsupported_blob_present(&self.content_root, entry);
                if blob_present {
                    tracing::info!(
                        "Entry {} has unsupported type {} but its blob {} exists",
                        display_path,
                        code,
                        entry.identifier
                    );
                } else {
                    tracing::info!(
                        "Entry {} has unsupported type {} and no blob",
                        display_path,
                        code
                    );
                }
                EntryOutcome::Unsupported { code, blob_present }
            }
        };

        ProcessedEntry {
            display_path,
            record,
            decode_failed: decode_error.is_some(),
            outcome,
        }
    }
}
