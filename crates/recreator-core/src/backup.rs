//! Backup directory layout and descriptor plists

use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use serde::Serialize;

use crate::error::SetupError;

pub const MANIFEST_PLIST: &str = "Manifest.plist";
pub const INFO_PLIST: &str = "Info.plist";
pub const STATUS_PLIST: &str = "Status.plist";
pub const MANIFEST_DB: &str = "Manifest.db";
pub const LEGACY_MANIFEST: &str = "Manifest.mbdb";

/// What a backup directory contains, read from its descriptor plists
#[derive(Debug, Clone, Serialize)]
pub struct BackupLayout {
    pub root: PathBuf,
    pub serial_number: String,
    pub device_name: Option<String>,
    pub product_version: Option<String>,
    pub is_encrypted: bool,
    /// Backup format version from Manifest.plist
    pub version: Option<String>,
    pub has_status: bool,
    pub manifest_db: Option<PathBuf>,
    pub legacy_manifest: Option<PathBuf>,
}

impl BackupLayout {
    /// Read descriptors from a backup directory
    ///
    /// Manifest.plist and Info.plist are required; Status.plist is optional.
    pub fn read(backup_dir: impl AsRef<Path>) -> Result<Self, SetupError> {
        let root = backup_dir.as_ref().to_path_buf();

        let manifest = read_descriptor(&root.join(MANIFEST_PLIST))?;
        let info = read_descriptor(&root.join(INFO_PLIST))?;

        let has_status = root.join(STATUS_PLIST).is_file();
        if has_status {
            tracing::debug!("Found {}", STATUS_PLIST);
        } else {
            tracing::warn!(
                "{} not found in {}; continuing without it",
                STATUS_PLIST,
                root.display()
            );
        }

        let is_encrypted = manifest
            .get("IsEncrypted")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        let version = manifest.get("Version").and_then(text_of);

        let manifest_db = Some(root.join(MANIFEST_DB)).filter(|path| path.is_file());
        let legacy_manifest = Some(root.join(LEGACY_MANIFEST)).filter(|path| path.is_file());
        if legacy_manifest.is_some() {
            tracing::debug!("Older {} found", LEGACY_MANIFEST);
        }
        if manifest_db.is_some() {
            tracing::debug!("Modern {} found", MANIFEST_DB);
        }

        Ok(Self {
            serial_number: info
                .get("Serial Number")
                .and_then(text_of)
                .unwrap_or_default(),
            device_name: info.get("Device Name").and_then(text_of),
            product_version: info.get("Product Version").and_then(text_of),
            is_encrypted,
            version,
            has_status,
            manifest_db,
            legacy_manifest,
            root,
        })
    }

    /// `output_root/Device_<serial>_Folders`
    pub fn device_output_dir(&self, output_root: &Path) -> PathBuf {
        let serial = crate::recreate::sanitize_component(&self.serial_number).replace('/', "_");
        output_root.join(format!("Device_{}_Folders", serial))
    }

    /// Manifest.db path, or the reason recreation cannot proceed
    pub fn require_manifest_db(&self) -> Result<&Path, SetupError> {
        if self.is_encrypted {
            return Err(SetupError::Encrypted);
        }
        match (&self.manifest_db, &self.legacy_manifest) {
            (Some(path), _) => Ok(path.as_path()),
            (None, Some(_)) => Err(SetupError::LegacyManifest),
            (None, None) => Err(SetupError::MissingManifest(self.root.clone())),
        }
    }
}

fn read_descriptor(path: &Path) -> Result<Dictionary, SetupError> {
    if !path.is_file() {
        return Err(SetupError::MissingDescriptor(path.to_path_buf()));
    }
    let value = Value::from_file(path).map_err(|source| SetupError::Descriptor {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("Found {}", path.display());
    Ok(value.into_dictionary().unwrap_or_else(Dictionary::new))
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Real(real) => Some(real.to_string()),
        Value::Integer(integer) => integer.as_signed().map(|value| value.to_string()),
        _ => None,
    }
}
