//! Conversion between extended value trees and plain JSON-compatible data.
//!
//! A [`Value`] extends the plain JSON data model with timestamps, binary
//! blobs, ordered maps with arbitrary keys, and sets. Kinds that JSON cannot
//! express natively travel as tagged objects of the shape
//! `{"__t": "<kind>", "__v": <payload>}`:
//!
//! - `Date` — the timestamp as epoch milliseconds
//! - `Buffer` — the blob as an array of byte values
//! - `Map` — the entries as an array of `[key, value]` pairs
//! - `Set` — the elements as an array
//!
//! Objects with an unrecognized tag are treated as plain objects, so the
//! format is forward-compatible with new tags.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;
use thiserror::Error;

/// Field marking a tagged object and naming its kind.
const TAG: &str = "__t";
/// Field carrying a tagged object's payload.
const PAYLOAD: &str = "__v";

/// An extended value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An absent value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number, integer or float.
    Number(Number),
    /// A string.
    String(String),
    /// A point in time, carried at millisecond precision.
    Timestamp(DateTime<Utc>),
    /// A binary blob.
    Bytes(Vec<u8>),
    /// An ordered map with arbitrary keys.
    Map(Vec<(Value, Value)>),
    /// A set of unique values, in insertion order.
    Set(Vec<Value>),
    /// An array.
    Array(Vec<Value>),
    /// A plain object with string keys.
    Object(BTreeMap<String, Value>),
}

/// An error converting plain data back into a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlainDataError {
    /// A tagged object's payload does not fit its tag.
    #[error("malformed {0} payload: {1}")]
    Malformed(&'static str, String),
}

fn malformed(tag: &'static str, detail: impl Into<String>) -> PlainDataError {
    PlainDataError::Malformed(tag, detail.into())
}

fn tagged(tag: &str, payload: serde_json::Value) -> serde_json::Value {
    let mut object = serde_json::Map::with_capacity(2);
    object.insert(TAG.to_owned(), tag.into());
    object.insert(PAYLOAD.to_owned(), payload);
    serde_json::Value::Object(object)
}

/// Converts a [`Value`] into its plain JSON-compatible representation.
pub fn to_plain(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => s.clone().into(),
        Value::Timestamp(ts) => tagged("Date", ts.timestamp_millis().into()),
        Value::Bytes(bytes) => tagged("Buffer", bytes.clone().into()),
        Value::Map(entries) => {
            let pairs = entries
                .iter()
                .map(|(key, value)| serde_json::Value::Array(vec![to_plain(key), to_plain(value)]))
                .collect();
            tagged("Map", serde_json::Value::Array(pairs))
        }
        Value::Set(elements) => {
            let elements = elements.iter().map(to_plain).collect();
            tagged("Set", serde_json::Value::Array(elements))
        }
        Value::Array(values) => serde_json::Value::Array(values.iter().map(to_plain).collect()),
        Value::Object(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), to_plain(value)))
                .collect(),
        ),
    }
}

/// Converts plain data back into a [`Value`].
///
/// Objects carrying a known `__t` tag are decoded into the corresponding
/// extended kind; objects with an unknown tag, or none, become
/// [`Value::Object`]s. Fails if a known tag's payload has the wrong shape.
pub fn from_plain(plain: &serde_json::Value) -> Result<Value, PlainDataError> {
    match plain {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => Ok(Value::Number(n.clone())),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Array(values) => {
            let values = values.iter().map(from_plain).collect::<Result<_, _>>()?;
            Ok(Value::Array(values))
        }
        serde_json::Value::Object(fields) => {
            if let Some(serde_json::Value::String(tag)) = fields.get(TAG) {
                let payload = fields.get(PAYLOAD);
                match tag.as_str() {
                    "Date" => return decode_timestamp(payload),
                    "Buffer" => return decode_bytes(payload),
                    "Map" => return decode_map(payload),
                    "Set" => return decode_set(payload),
                    // Unknown tags fall through to plain-object handling.
                    _ => {}
                }
            }

            let fields = fields
                .iter()
                .map(|(key, value)| Ok((key.clone(), from_plain(value)?)))
                .collect::<Result<_, _>>()?;
            Ok(Value::Object(fields))
        }
    }
}

fn decode_timestamp(payload: Option<&serde_json::Value>) -> Result<Value, PlainDataError> {
    let millis = payload
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| malformed("Date", "expected epoch milliseconds"))?;
    let ts = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| malformed("Date", format!("timestamp out of range: {millis}")))?;
    Ok(Value::Timestamp(ts))
}

fn decode_bytes(payload: Option<&serde_json::Value>) -> Result<Value, PlainDataError> {
    let values = payload
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| malformed("Buffer", "expected an array of bytes"))?;
    let bytes = values
        .iter()
        .map(|value| {
            value
                .as_u64()
                .and_then(|byte| u8::try_from(byte).ok())
                .ok_or_else(|| malformed("Buffer", format!("invalid byte value: {value}")))
        })
        .collect::<Result<_, _>>()?;
    Ok(Value::Bytes(bytes))
}

fn decode_map(payload: Option<&serde_json::Value>) -> Result<Value, PlainDataError> {
    let entries = payload
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| malformed("Map", "expected an array of entries"))?;
    let mut pairs = Vec::with_capacity(entries.len());
    for entry in entries {
        // Entries that are not `[key, value]` pairs are skipped.
        match entry.as_array().map(Vec::as_slice) {
            Some([key, value]) => pairs.push((from_plain(key)?, from_plain(value)?)),
            _ => continue,
        }
    }
    Ok(Value::Map(pairs))
}

fn decode_set(payload: Option<&serde_json::Value>) -> Result<Value, PlainDataError> {
    let values = payload
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| malformed("Set", "expected an array of elements"))?;
    let mut elements: Vec<Value> = Vec::with_capacity(values.len());
    for value in values {
        let element = from_plain(value)?;
        if !elements.contains(&element) {
            elements.push(element);
        }
    }
    Ok(Value::Set(elements))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_plain(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let plain = serde_json::Value::deserialize(deserializer)?;
        from_plain(&plain).map_err(D::Error::custom)
    }
}
