//! Keyed-archive decoding
//!
//! A keyed archive stores compound values as UIDs into a shared object table.
//! `codec` turns raw plist bytes into that table plus per-object skeletons,
//! and `resolver` walks the skeletons into a plain nested value tree.

pub mod codec;
pub mod resolver;

pub use codec::{ArchiveCodec, ConversionTable, KeyedArchive, ObjectDecoder, ObjectTable};
pub use resolver::{ObjectGraphResolver, ResolverConfig};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// Key the archive format uses to tag an object with its class
pub const CLASS_KEY: &str = "$class";

/// Terminal value decoded from the archive
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Data(Vec<u8>),
    Date(DateTime<Utc>),
}

/// One decoded object as handed out by an [`ObjectDecoder`]
///
/// Container values may still hold `Reference`s into the object table.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveNode {
    Mapping(Vec<(String, ArchiveNode)>),
    Sequence(Vec<ArchiveNode>),
    Reference(u64),
    Scalar(Scalar),
}

/// Output of resolution: no references, no class tags
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Mapping(Mapping),
    Sequence(Vec<ResolvedValue>),
    Scalar(Scalar),
}

impl ResolvedValue {
    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            ResolvedValue::Mapping(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            ResolvedValue::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }
}

/// Insertion-ordered map with unique keys
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    entries: Vec<(String, ResolvedValue)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing (in place) any earlier value under the same key
    pub fn insert(&mut self, key: impl Into<String>, value: ResolvedValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ResolvedValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Mapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl Serialize for ResolvedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ResolvedValue::Mapping(mapping) => mapping.serialize(serializer),
            ResolvedValue::Sequence(items) => serializer.collect_seq(items),
            ResolvedValue::Scalar(scalar) => scalar.serialize(serializer),
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Null => serializer.serialize_none(),
            Scalar::Boolean(value) => serializer.serialize_bool(*value),
            Scalar::Integer(value) => serializer.serialize_i64(*value),
            Scalar::Real(value) => serializer.serialize_f64(*value),
            Scalar::Text(value) => serializer.serialize_str(value),
            Scalar::Data(bytes) => serializer.collect_seq(bytes),
            Scalar::Date(date) => {
                serializer.serialize_str(&date.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}
