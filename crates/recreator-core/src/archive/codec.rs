//! Binary plist keyed-archive codec
//!
//! Byte-level plist parsing is done by the `plist` crate. This module only
//! knows the keyed-archive envelope (`$objects`, `$top`) and how to turn one
//! table object into an [`ArchiveNode`] skeleton, optionally applying the
//! common Foundation class conversions.

use std::io::Cursor;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use plist::{Dictionary, Value};

use super::{ArchiveNode, Scalar, CLASS_KEY};
use crate::error::DecodeError;

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z
pub const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

const NULL_MARKER: &str = "$null";

/// Flat, immutable table of archived objects indexed by UID
#[derive(Debug, Clone, Default)]
pub struct ObjectTable {
    objects: Vec<Value>,
}

impl ObjectTable {
    pub fn new(objects: Vec<Value>) -> Self {
        Self { objects }
    }

    pub fn get(&self, index: u64) -> Result<&Value, DecodeError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.objects.get(i))
            .ok_or(DecodeError::ObjectIndexOutOfRange {
                index,
                len: self.objects.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Turns one object table entry into a skeleton
pub trait ObjectDecoder {
    fn decode_object(&self, table: &ObjectTable, index: u64) -> Result<ArchiveNode, DecodeError>;
}

impl<F> ObjectDecoder for F
where
    F: Fn(&ObjectTable, u64) -> Result<ArchiveNode, DecodeError>,
{
    fn decode_object(&self, table: &ObjectTable, index: u64) -> Result<ArchiveNode, DecodeError> {
        self(table, index)
    }
}

/// Which class conversions the codec applies while decoding objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConversionTable {
    /// Convert NSDictionary, NSArray, NSSet, NSString, NSData, NSDate and NSUUID
    #[default]
    Common,
    /// Leave every object as its raw structural skeleton
    Structural,
}

/// Object decoder for keyed archives
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveCodec {
    conversions: ConversionTable,
}

impl ArchiveCodec {
    pub fn new(conversions: ConversionTable) -> Self {
        Self { conversions }
    }

    pub fn conversions(&self) -> ConversionTable {
        self.conversions
    }

    fn convert_common(
        &self,
        class: &str,
        object: &Dictionary,
        table: &ObjectTable,
    ) -> Result<Option<ArchiveNode>, DecodeError> {
        let node = match class {
            "NSDictionary" | "NSMutableDictionary" => {
                let (Some(Value::Array(keys)), Some(Value::Array(values))) =
                    (object.get("NS.keys"), object.get("NS.objects"))
                else {
                    return Ok(None);
                };
                if keys.len() != values.len() {
                    return Err(DecodeError::UnexpectedShape(format!(
                        "{} has {} keys but {} objects",
                        class,
                        keys.len(),
                        values.len()
                    )));
                }
                let mut entries = Vec::with_capacity(keys.len());
                for (key, value) in keys.iter().zip(values) {
                    entries.push((dictionary_key(key, table)?, skeleton(value)));
                }
                ArchiveNode::Mapping(entries)
            }
            "NSArray" | "NSMutableArray" | "NSSet" | "NSMutableSet" | "NSOrderedSet"
            | "NSMutableOrderedSet" => match object.get("NS.objects") {
                Some(Value::Array(items)) => ArchiveNode::Sequence(items.iter().map(skeleton).collect()),
                _ => return Ok(None),
            },
            "NSString" | "NSMutableString" => match (object.get("NS.string"), object.get("NS.bytes")) {
                (Some(Value::String(text)), _) => ArchiveNode::Scalar(Scalar::Text(text.clone())),
                (_, Some(Value::Data(bytes))) => {
                    ArchiveNode::Scalar(Scalar::Text(String::from_utf8_lossy(bytes).into_owned()))
                }
                _ => return Ok(None),
            },
            "NSData" | "NSMutableData" => match object.get("NS.data") {
                Some(Value::Data(bytes)) => ArchiveNode::Scalar(Scalar::Data(bytes.clone())),
                _ => return Ok(None),
            },
            "NSDate" => {
                let seconds = match object.get("NS.time") {
                    Some(Value::Real(seconds)) => *seconds,
                    Some(Value::Integer(seconds)) => match seconds.as_signed() {
                        Some(seconds) => seconds as f64,
                        None => return Ok(None),
                    },
                    _ => return Ok(None),
                };
                match apple_time_to_utc(seconds) {
                    Some(date) => ArchiveNode::Scalar(Scalar::Date(date)),
                    None => {
                        tracing::warn!("NSDate value {} is out of range", seconds);
                        ArchiveNode::Scalar(Scalar::Null)
                    }
                }
            }
            "NSUUID" => match object.get("NS.uuidbytes") {
                Some(Value::Data(bytes)) => ArchiveNode::Scalar(Scalar::Data(bytes.clone())),
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };
        Ok(Some(node))
    }
}

impl ObjectDecoder for ArchiveCodec {
    fn decode_object(&self, table: &ObjectTable, index: u64) -> Result<ArchiveNode, DecodeError> {
        match table.get(index)? {
            Value::String(text) if text == NULL_MARKER => Ok(ArchiveNode::Scalar(Scalar::Null)),
            Value::Dictionary(object) => {
                if self.conversions == ConversionTable::Common {
                    if let Some(class) = class_name(object, table) {
                        if let Some(node) = self.convert_common(class, object, table)? {
                            return Ok(node);
                        }
                        tracing::trace!("No conversion applied for class {}", class);
                    }
                }
                Ok(mapping_skeleton(object))
            }
            other => Ok(skeleton(other)),
        }
    }
}

/// Parsed keyed-archive envelope
#[derive(Debug, Clone)]
pub struct KeyedArchive {
    table: ObjectTable,
    roots: Vec<(String, ArchiveNode)>,
}

impl KeyedArchive {
    /// Parse a binary (or XML) plist blob holding a keyed archive
    pub fn from_bytes(blob: &[u8]) -> Result<Self, DecodeError> {
        let value = Value::from_reader(Cursor::new(blob))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Dictionary(mut envelope) = value else {
            return Err(DecodeError::NotKeyedArchive(
                "top-level object is not a dictionary".to_string(),
            ));
        };

        let objects = match envelope.remove("$objects") {
            Some(Value::Array(objects)) => objects,
            _ => {
                return Err(DecodeError::NotKeyedArchive(
                    "$objects array not found".to_string(),
                ))
            }
        };
        let top = match envelope.remove("$top") {
            Some(Value::Dictionary(top)) => top,
            _ => {
                return Err(DecodeError::NotKeyedArchive(
                    "$top element not found".to_string(),
                ))
            }
        };

        let roots = top
            .into_iter()
            .map(|(name, value)| {
                let node = skeleton(&value);
                (name, node)
            })
            .collect();

        Ok(Self {
            table: ObjectTable::new(objects),
            roots,
        })
    }

    pub fn table(&self) -> &ObjectTable {
        &self.table
    }

    /// Root entries from `$top`, in archive order
    pub fn roots(&self) -> &[(String, ArchiveNode)] {
        &self.roots
    }

    pub fn root_names(&self) -> impl Iterator<Item = &str> {
        self.roots.iter().map(|(name, _)| name.as_str())
    }
}

/// Structural skeleton of a raw value; UIDs become references
pub fn skeleton(value: &Value) -> ArchiveNode {
    match value {
        Value::Uid(uid) => ArchiveNode::Reference(uid.get()),
        Value::Dictionary(dict) => mapping_skeleton(dict),
        Value::Array(items) => ArchiveNode::Sequence(items.iter().map(skeleton).collect()),
        other => ArchiveNode::Scalar(scalar_of(other)),
    }
}

fn mapping_skeleton(dict: &Dictionary) -> ArchiveNode {
    ArchiveNode::Mapping(
        dict.iter()
            .map(|(key, value)| (key.clone(), skeleton(value)))
            .collect(),
    )
}

fn scalar_of(value: &Value) -> Scalar {
    match value {
        Value::Boolean(flag) => Scalar::Boolean(*flag),
        Value::Integer(integer) => match integer.as_signed() {
            Some(signed) => Scalar::Integer(signed),
            // Only unsigned values above i64::MAX land here
            None => integer
                .as_unsigned()
                .map(|unsigned| Scalar::Real(unsigned as f64))
                .unwrap_or(Scalar::Null),
        },
        Value::Real(real) => Scalar::Real(*real),
        Value::String(text) => Scalar::Text(text.clone()),
        Value::Data(bytes) => Scalar::Data(bytes.clone()),
        Value::Date(date) => Scalar::Date(DateTime::<Utc>::from(SystemTime::from(*date))),
        _ => Scalar::Null,
    }
}

fn class_name<'a>(object: &Dictionary, table: &'a ObjectTable) -> Option<&'a str> {
    let Some(Value::Uid(uid)) = object.get(CLASS_KEY) else {
        return None;
    };
    match table.get(uid.get()).ok()? {
        Value::Dictionary(class) => class.get("$classname").and_then(Value::as_string),
        _ => None,
    }
}

// Keys are looked up directly rather than through decode_object so a
// self-referencing key cannot recurse.
fn dictionary_key(key: &Value, table: &ObjectTable) -> Result<String, DecodeError> {
    let target = match key {
        Value::Uid(uid) => table.get(uid.get())?,
        other => other,
    };
    match target {
        Value::String(text) => Ok(text.clone()),
        Value::Dictionary(object) => match object.get("NS.string") {
            Some(Value::String(text)) => Ok(text.clone()),
            _ => Err(DecodeError::UnexpectedShape(
                "dictionary key is not a string object".to_string(),
            )),
        },
        _ => Err(DecodeError::UnexpectedShape(
            "dictionary key is not text".to_string(),
        )),
    }
}

fn apple_time_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    let unix = (whole as i64).checked_add(APPLE_EPOCH_OFFSET)?;
    DateTime::from_timestamp(unix, nanos)
}
