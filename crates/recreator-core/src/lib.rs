use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub mod archive;
pub mod backup;
pub mod error;
pub mod index;
pub mod manifest;
pub mod metadata;
pub mod recreate;

pub use archive::{
    ArchiveCodec, ArchiveNode, ConversionTable, KeyedArchive, Mapping, ObjectDecoder,
    ObjectGraphResolver, ObjectTable, ResolvedValue, ResolverConfig, Scalar,
};
pub use backup::BackupLayout;
pub use error::{DecodeError, IndexWriteError, ManifestError, ReconstructionError, SetupError};
pub use index::{IndexStats, MetadataIndexWriter, DEFAULT_BATCH_SIZE};
pub use manifest::{BackupEntry, EntryKind, ManifestDb};
pub use metadata::{MetadataRecord, MetadataRecordDecoder};
pub use recreate::{
    EntryOutcome, RecreateConfig, RecreateProgress, Recreator, RunSummary, TimestampOutcome,
};

/// Directory under the device folder that receives the recreated tree
pub const RECREATED_TREE_DIR: &str = "Recreated_File_Structure";
/// Metadata index file name under the device folder
pub const METADATA_INDEX_FILE: &str = "File_Metadata.db";

/// Where a recreation run put its output, plus its counters
#[derive(Debug, Clone, Serialize)]
pub struct RecreationReport {
    pub device_output_dir: PathBuf,
    pub recreated_tree: PathBuf,
    pub metadata_index: PathBuf,
    pub summary: RunSummary,
}

/// A backup that passed every setup check and is ready to recreate
pub struct BackupRecreation {
    layout: BackupLayout,
    manifest: ManifestDb,
    index: MetadataIndexWriter,
    recreator: Recreator,
    device_output_dir: PathBuf,
    metadata_index: PathBuf,
}

impl BackupRecreation {
    /// Read the backup descriptors, create the output folders and open both databases
    ///
    /// Every failure here is a `SetupError`; nothing has been recreated yet.
    pub fn prepare(
        backup_dir: &Path,
        output_dir: &Path,
        config: RecreateConfig,
    ) -> std::result::Result<Self, SetupError> {
        let layout = BackupLayout::read(backup_dir)?;
        let manifest_path = layout.require_manifest_db()?.to_path_buf();

        let device_output_dir = layout.device_output_dir(output_dir);
        tracing::debug!("Trying to create directory: {}", device_output_dir.display());
        std::fs::create_dir_all(&device_output_dir).map_err(|source| SetupError::Destination {
            path: device_output_dir.clone(),
            source,
        })?;

        let manifest = ManifestDb::open(&manifest_path)?;
        let metadata_index = device_output_dir.join(METADATA_INDEX_FILE);
        let index = MetadataIndexWriter::with_batch_size(&metadata_index, config.batch_size)?;

        let mut recreator = Recreator::new(
            backup_dir,
            device_output_dir.join(RECREATED_TREE_DIR),
            config,
        );
        match manifest.count() {
            Ok(total) => recreator.set_total_entries(total),
            Err(e) => tracing::warn!("Could not count manifest entries: {}", e),
        }

        Ok(Self {
            layout,
            manifest,
            index,
            recreator,
            device_output_dir,
            metadata_index,
        })
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    /// Access the pipeline to attach progress reporting or cancellation
    pub fn recreator_mut(&mut self) -> &mut Recreator {
        &mut self.recreator
    }

    /// Recreate every manifest entry
    pub fn run(self) -> std::result::Result<RecreationReport, SetupError> {
        let Self {
            manifest,
            index,
            recreator,
            device_output_dir,
            metadata_index,
            ..
        } = self;

        let summary = manifest.with_entries(|entries| recreator.run(entries, index))??;

        Ok(RecreationReport {
            device_output_dir,
            recreated_tree: recreator.destination_root().to_path_buf(),
            metadata_index,
            summary,
        })
    }
}

/// Recreate a backup's original file layout and metadata index under `output_dir`
pub fn recreate_backup(
    backup_dir: &Path,
    output_dir: &Path,
    config: RecreateConfig,
) -> Result<RecreationReport> {
    tracing::info!(
        "Starting recreation of {} into {}",
        backup_dir.display(),
        output_dir.display()
    );

    let recreation = BackupRecreation::prepare(backup_dir, output_dir, config)
        .with_context(|| format!("Failed to prepare backup {}", backup_dir.display()))?;
    let report = recreation
        .run()
        .with_context(|| format!("Failed to recreate backup {}", backup_dir.display()))?;

    tracing::info!(
        "Recreation of {} complete: {} entries, {} with errors",
        backup_dir.display(),
        report.summary.entries_processed,
        report.summary.entries_with_errors()
    );
    Ok(report)
}

/// Resolve a standalone keyed-archive file into a plain value tree
pub fn deserialize_archive_file(
    path: &Path,
    conversions: ConversionTable,
    resolver: ResolverConfig,
) -> Result<ResolvedValue> {
    let blob = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value = MetadataRecordDecoder::new(conversions, resolver)
        .resolve_archive(&blob)
        .with_context(|| format!("Failed to deserialize {}", path.display()))?;
    Ok(value)
}
