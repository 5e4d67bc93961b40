//! Core type definitions for Flatstore

use crate::error::{Result, StoreError};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier carried by a row that has not been inserted yet
pub const SENTINEL_ID: i64 = -1;

/// Row identifier
///
/// A fresh `RowId` holds [`SENTINEL_ID`] and can be set freely. Once the row
/// has been inserted or loaded from a table file the identifier is frozen and
/// [`RowId::set`] fails with an invariant violation.
///
/// Serialized as a plain `i64`; deserialization always yields a frozen id.
#[derive(Debug, Clone, Copy)]
pub struct RowId {
    value: i64,
    persisted: bool,
}

impl RowId {
    pub const fn new() -> Self {
        RowId {
            value: SENTINEL_ID,
            persisted: false,
        }
    }

    /// Unpersisted id with an explicit value (used when seeding data)
    pub const fn with_value(value: i64) -> Self {
        RowId {
            value,
            persisted: false,
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn is_sentinel(&self) -> bool {
        self.value == SENTINEL_ID
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Change the identifier of a row that has not been persisted yet
    pub fn set(&mut self, value: i64) -> Result<()> {
        if self.persisted {
            return Err(StoreError::InvariantViolation(format!(
                "row id {} is persisted and cannot be changed to {}",
                self.value, value
            )));
        }
        self.value = value;
        Ok(())
    }

    pub(crate) fn assign(&mut self, value: i64) {
        self.value = value;
        self.persisted = true;
    }
}

impl Default for RowId {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RowId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for RowId {}

impl Hash for RowId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl Serialize for RowId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.value)
    }
}

impl<'de> Deserialize<'de> for RowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Ok(RowId {
            value,
            persisted: true,
        })
    }
}

/// Property values (heterogeneous types)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// True for the type's zero value; exempt from checks on
    /// default-value-allowed relationships
    pub fn is_default(&self) -> bool {
        match self {
            PropertyValue::Null => true,
            PropertyValue::Bool(b) => !*b,
            PropertyValue::Int(v) => *v == 0,
            PropertyValue::Float(v) => *v == 0.0,
            PropertyValue::String(s) => s.is_empty(),
            PropertyValue::Bytes(b) => b.is_empty(),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(v: Vec<u8>) -> Self {
        PropertyValue::Bytes(v)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(PropertyValue::Null)
    }
}

/// Ordered wrapper around `PropertyValue` for index maps
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
    Bytes(Vec<u8>),
}

/// Wrapper for f64 to make it Ord (required for BTreeMap keys)
#[derive(Debug, Clone, Copy)]
pub struct OrderedFloat(f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<&PropertyValue> for IndexKey {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Null => IndexKey::Null,
            PropertyValue::Bool(b) => IndexKey::Bool(*b),
            PropertyValue::Int(i) => IndexKey::Int(*i),
            PropertyValue::Float(f) => IndexKey::Float(OrderedFloat(*f)),
            PropertyValue::String(s) => IndexKey::String(s.clone()),
            PropertyValue::Bytes(b) => IndexKey::Bytes(b.clone()),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Null => write!(f, "null"),
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Int(i) => write!(f, "{}", i),
            IndexKey::Float(v) => write!(f, "{}", v.0),
            IndexKey::String(s) => write!(f, "{:?}", s),
            IndexKey::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Key over one or more properties, in declaration order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompositeKey(pub Vec<IndexKey>);

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}
