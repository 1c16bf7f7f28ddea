//! Per-file metadata records decoded from keyed-archive blobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::{
    ArchiveCodec, ConversionTable, KeyedArchive, Mapping, ObjectGraphResolver, ResolvedValue,
    ResolverConfig, Scalar,
};
use crate::error::DecodeError;

/// Field under which a wrapped data object keeps its payload
const DATA_PAYLOAD_KEY: &str = "NS.data";

/// Normalized metadata for one backup entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub last_modified: Option<DateTime<Utc>>,
    pub last_status_change: Option<DateTime<Utc>>,
    pub birth: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub inode_number: Option<u64>,
    pub flags: Option<i64>,
    pub user_id: Option<u32>,
    pub group_id: Option<u32>,
    pub mode: Option<u32>,
    pub protection_class: Option<i64>,
    pub extended_attributes: Option<Vec<u8>>,
}

/// Decodes metadata blobs into [`MetadataRecord`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataRecordDecoder {
    codec: ArchiveCodec,
    resolver: ResolverConfig,
}

impl MetadataRecordDecoder {
    pub fn new(conversions: ConversionTable, resolver: ResolverConfig) -> Self {
        Self {
            codec: ArchiveCodec::new(conversions),
            resolver,
        }
    }

    /// Decode a blob; fails on anything that is not a mapping-shaped keyed archive
    pub fn decode(&self, blob: &[u8]) -> Result<MetadataRecord, DecodeError> {
        let value = self.resolve_archive(blob)?;
        match value {
            ResolvedValue::Mapping(fields) => Ok(record_from_fields(&fields)),
            ResolvedValue::Sequence(_) => Err(DecodeError::UnexpectedShape(
                "archive root is a sequence, expected a mapping".to_string(),
            )),
            ResolvedValue::Scalar(_) => Err(DecodeError::UnexpectedShape(
                "archive root is a scalar, expected a mapping".to_string(),
            )),
        }
    }

    /// Decode a blob, logging and falling back to an empty record on failure
    pub fn decode_lenient(&self, blob: &[u8]) -> (MetadataRecord, Option<DecodeError>) {
        match self.decode(blob) {
            Ok(record) => (record, None),
            Err(e) => {
                tracing::warn!("Failed to parse file metadata: {}", e);
                (MetadataRecord::default(), Some(e))
            }
        }
    }

    /// Resolve every `$top` root of a keyed archive into a plain value tree
    ///
    /// A single root is returned directly; several roots are returned as a
    /// mapping keyed by root name.
    pub fn resolve_archive(&self, blob: &[u8]) -> Result<ResolvedValue, DecodeError> {
        let archive = KeyedArchive::from_bytes(blob)?;
        let resolver =
            ObjectGraphResolver::new(archive.table(), &self.codec).with_config(self.resolver);

        match archive.roots() {
            [] => Err(DecodeError::NotKeyedArchive(
                "$top has no root entries".to_string(),
            )),
            [(name, root)] => {
                tracing::trace!("Deserializing archive root {}", name);
                resolver.resolve(root)
            }
            roots => {
                let mut by_name = Mapping::new();
                for (name, root) in roots {
                    by_name.insert(name.clone(), resolver.resolve(root)?);
                }
                Ok(ResolvedValue::Mapping(by_name))
            }
        }
    }
}

fn record_from_fields(fields: &Mapping) -> MetadataRecord {
    MetadataRecord {
        last_modified: timestamp_field(fields, "LastModified"),
        last_status_change: timestamp_field(fields, "LastStatusChange"),
        birth: timestamp_field(fields, "Birth"),
        size: integer_field(fields, "Size"),
        inode_number: integer_field(fields, "InodeNumber"),
        flags: integer_field(fields, "Flags"),
        user_id: integer_field(fields, "UserID"),
        group_id: integer_field(fields, "GroupID"),
        mode: integer_field(fields, "Mode"),
        protection_class: integer_field(fields, "ProtectionClass"),
        extended_attributes: fields.get("ExtendedAttributes").and_then(unwrap_data),
    }
}

fn integer_field<T: TryFrom<i64>>(fields: &Mapping, key: &str) -> Option<T> {
    match fields.get(key)?.as_scalar()? {
        Scalar::Integer(value) => T::try_from(*value).ok(),
        _ => None,
    }
}

fn timestamp_field(fields: &Mapping, key: &str) -> Option<DateTime<Utc>> {
    let scalar = fields.get(key)?.as_scalar()?;
    read_unix_time(scalar)
}

/// Extended attributes arrive either as raw data or wrapped in a container
/// that keeps the bytes under `NS.data`.
fn unwrap_data(value: &ResolvedValue) -> Option<Vec<u8>> {
    match value {
        ResolvedValue::Scalar(Scalar::Data(bytes)) => Some(bytes.clone()),
        ResolvedValue::Mapping(wrapper) => match wrapper.get(DATA_PAYLOAD_KEY) {
            Some(ResolvedValue::Scalar(Scalar::Data(bytes))) => Some(bytes.clone()),
            _ => {
                tracing::debug!("ExtendedAttributes container has no data payload");
                None
            }
        },
        _ => None,
    }
}

/// Convert an epoch-seconds value to a UTC timestamp
///
/// Zero, null and empty text mean "absent". Anything that cannot be
/// represented is logged and treated as absent.
pub fn read_unix_time(value: &Scalar) -> Option<DateTime<Utc>> {
    let seconds = match value {
        Scalar::Null => return None,
        Scalar::Integer(0) => return None,
        Scalar::Integer(seconds) => {
            let converted = DateTime::from_timestamp(*seconds, 0);
            if converted.is_none() {
                tracing::error!("Failed to convert timestamp from value {}: out of range", seconds);
            }
            return converted;
        }
        Scalar::Date(date) => return Some(*date),
        Scalar::Real(seconds) => *seconds,
        Scalar::Text(text) if text.is_empty() => return None,
        Scalar::Text(text) => match text.trim().parse::<f64>() {
            Ok(seconds) => seconds,
            Err(e) => {
                tracing::error!("Failed to convert timestamp from value {:?}: {}", text, e);
                return None;
            }
        },
        Scalar::Boolean(_) | Scalar::Data(_) => {
            tracing::error!("Failed to convert timestamp from value {:?}: not numeric", value);
            return None;
        }
    };

    if seconds == 0.0 {
        return None;
    }
    let converted = float_seconds_to_utc(seconds);
    if converted.is_none() {
        tracing::error!("Failed to convert timestamp from value {}: out of range", seconds);
    }
    converted
}

fn float_seconds_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds.abs() >= i64::MAX as f64 {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}
