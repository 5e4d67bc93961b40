//! Flatstore - Embedded Record Store
//!
//! Persists strongly typed rows to one flat binary file per table, with
//! sequence-based identifiers, composite unique indexes, cross-table
//! referential integrity and sliding in-memory caching.
//!
//! # Architecture
//!
//! - Codec Layer: length-framed bincode records, gzip, pluggable cipher
//! - Storage Layer: fixed header plus whole-block rewrite, exclusive file lock
//! - Index Layer: composite unique constraints over row properties
//! - Integrity Layer: foreign key manager shared by a registry's tables
//! - Cache Layer: background sweeper clearing idle tables
//! - Facade Layer: `Table<R>` per row type, owned by a `TableRegistry`
//!
//! # Example
//!
//! ```no_run
//! use flatstore_core::{Record, RowId, PropertyValue, Table, TableDescriptor, TableRegistry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Customer {
//!     id: RowId,
//!     email: String,
//! }
//!
//! impl Record for Customer {
//!     fn descriptor() -> TableDescriptor {
//!         TableDescriptor::new("Customers")
//!     }
//!     fn row_id(&self) -> &RowId {
//!         &self.id
//!     }
//!     fn row_id_mut(&mut self) -> &mut RowId {
//!         &mut self.id
//!     }
//!     fn property(&self, name: &str) -> Option<PropertyValue> {
//!         match name {
//!             "email" => Some(self.email.as_str().into()),
//!             _ => None,
//!         }
//!     }
//! }
//!
//! # fn main() -> flatstore_core::Result<()> {
//! let registry = TableRegistry::new("/var/lib/flatstore", None)?;
//! let customers = Table::<Customer>::open(&registry)?;
//!
//! let mut customer = Customer { id: RowId::new(), email: "ann@example.com".into() };
//! customers.insert(&mut customer)?;
//! assert_eq!(customer.id.value(), 0);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod types;
pub mod schema;
pub mod config;

// Storage modules
pub mod codec;
pub mod storage;
pub mod sequence;

// Constraint modules
pub mod index;
pub mod foreign_key;

// Cache module
pub mod cache;

// Facade and registry modules
pub mod table;
pub mod registry;
pub mod timing;

pub use error::{Result, StoreError};
pub use types::{CompositeKey, IndexKey, OrderedFloat, PropertyValue, RowId, SENTINEL_ID};
pub use schema::{
    CachingStrategy, Compression, ForeignKeyDeclaration, IndexDefinition, PropertySource, Record,
    RelationshipAttributes, TableDescriptor,
};
pub use config::RegistryConfig;

// Storage exports
pub use codec::{BlockCipher, RecordCodec};
pub use storage::{FileHeader, TableFile, HEADER_LEN, MAGIC};
pub use sequence::Sequences;

// Constraint exports
pub use index::{IndexSet, UniqueIndex};
pub use foreign_key::{ForeignKeyManager, Relationship, TableHandle, ValueLookup};

// Cache exports
pub use cache::{CacheStats, ClearReason, MemoryCleared};

// Facade and registry exports
pub use table::{OperationEvent, Table};
pub use registry::{TableInfo, TableLifecycleObserver, TableRegistry};
pub use timing::{Operation, TimingReport};
