//! Table metadata for Flatstore row types
//!
//! A row type implements [`Record`] to describe itself: the table it lives
//! in, how that table is compressed and cached, its unique indexes and its
//! foreign keys. This replaces runtime attribute discovery with an explicit,
//! statically typed declaration.

use crate::error::{Result, StoreError};
use crate::types::{PropertyValue, RowId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the implicit identifier property
pub const ID_PROPERTY: &str = "id";

/// Characters that may not appear in a table name (it becomes a file name)
pub const FORBIDDEN_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

const MAX_TABLE_NAME_LEN: usize = 128;

/// Record block compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn as_u8(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Gzip),
            _ => None,
        }
    }
}

/// How long a table keeps its decoded records in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachingStrategy {
    /// Records stay resident; never swept
    None,
    /// Records stay resident and cannot be released
    RetainForever,
    /// Records are cleared after `timeout_ms` without access
    SlidingTimeout { timeout_ms: i64 },
}

impl CachingStrategy {
    pub fn sliding(timeout_ms: i64) -> Self {
        CachingStrategy::SlidingTimeout { timeout_ms }
    }

    pub fn validate(&self) -> Result<()> {
        if let CachingStrategy::SlidingTimeout { timeout_ms } = self {
            if *timeout_ms <= 0 {
                return Err(StoreError::OutOfRange(format!(
                    "sliding timeout must be positive, got {} ms",
                    timeout_ms
                )));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            CachingStrategy::SlidingTimeout { timeout_ms } if *timeout_ms > 0 => {
                Some(Duration::from_millis(*timeout_ms as u64))
            }
            _ => None,
        }
    }
}

impl Default for CachingStrategy {
    fn default() -> Self {
        CachingStrategy::None
    }
}

/// Static per-row-type table metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub compression: Compression,
    pub caching: CachingStrategy,
    /// Version written to new table files
    pub version: u16,
    /// Overrides the registry's default page size
    pub page_size: Option<i32>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        TableDescriptor {
            name: name.into(),
            compression: Compression::None,
            caching: CachingStrategy::None,
            version: 1,
            page_size: None,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_caching(mut self, caching: CachingStrategy) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.name)?;
        self.caching.validate()?;
        if let Some(page_size) = self.page_size {
            if page_size <= 0 {
                return Err(StoreError::OutOfRange(format!(
                    "page size must be positive, got {}",
                    page_size
                )));
            }
        }
        Ok(())
    }
}

/// Check a table name against the forbidden character set
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Argument("table name is required".to_string()));
    }
    if name == "." || name == ".." {
        return Err(StoreError::Argument(format!("'{}' is not a valid table name", name)));
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(StoreError::Argument(format!(
            "table name exceeds {} bytes",
            MAX_TABLE_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| FORBIDDEN_NAME_CHARS.contains(c) || c.is_control())
    {
        return Err(StoreError::Argument(format!(
            "table name '{}' contains forbidden character {:?}",
            name, c
        )));
    }
    Ok(())
}

/// Unique constraint over one or more properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub properties: Vec<String>,
}

impl IndexDefinition {
    pub fn unique(name: impl Into<String>, properties: &[&str]) -> Self {
        IndexDefinition {
            name: name.into(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StoreError::Argument("index name is required".to_string()));
        }
        if self.properties.is_empty() || self.properties.iter().any(|p| p.is_empty()) {
            return Err(StoreError::Argument(format!(
                "index '{}' needs at least one named property",
                self.name
            )));
        }
        Ok(())
    }
}

/// Relationship flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipAttributes {
    /// Every value must resolve to a target row
    Normal,
    /// The type's default value (0, "", null) is exempt from checks
    AllowDefaultValue,
}

impl RelationshipAttributes {
    pub fn allows_default(&self) -> bool {
        matches!(self, RelationshipAttributes::AllowDefaultValue)
    }
}

/// Foreign key declared by a row type on its own table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDeclaration {
    pub target_table: String,
    pub source_property: String,
    pub target_property: String,
    pub attributes: RelationshipAttributes,
}

impl ForeignKeyDeclaration {
    pub fn new(target_table: &str, source_property: &str, target_property: &str) -> Self {
        ForeignKeyDeclaration {
            target_table: target_table.to_string(),
            source_property: source_property.to_string(),
            target_property: target_property.to_string(),
            attributes: RelationshipAttributes::Normal,
        }
    }

    pub fn allow_default(mut self) -> Self {
        self.attributes = RelationshipAttributes::AllowDefaultValue;
        self
    }
}

/// A strongly typed row stored in its own table file
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table metadata for this row type
    fn descriptor() -> TableDescriptor;

    fn row_id(&self) -> &RowId;

    fn row_id_mut(&mut self) -> &mut RowId;

    /// Value of a named property, used by indexes and foreign keys.
    /// `"id"` falls back to the row id when not handled here.
    fn property(&self, name: &str) -> Option<PropertyValue>;

    fn unique_indexes() -> Vec<IndexDefinition> {
        Vec::new()
    }

    fn foreign_keys() -> Vec<ForeignKeyDeclaration> {
        Vec::new()
    }

    fn id(&self) -> i64 {
        self.row_id().value()
    }
}

/// Object-safe property access used across table boundaries
pub trait PropertySource {
    fn property_value(&self, name: &str) -> Option<PropertyValue>;
}

impl<R: Record> PropertySource for R {
    fn property_value(&self, name: &str) -> Option<PropertyValue> {
        self.property(name).or_else(|| {
            if name == ID_PROPERTY {
                Some(PropertyValue::Int(self.id()))
            } else {
                None
            }
        })
    }
}
