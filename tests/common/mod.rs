//! Row types and helpers shared by the integration tests

#![allow(dead_code)]

use flatstore_core::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const SESSION_TIMEOUT_MS: i64 = 100;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn registry(dir: &TempDir) -> Arc<TableRegistry> {
    init_tracing();
    let config = RegistryConfig::new(dir.path()).with_sweep_interval(Duration::from_millis(20));
    TableRegistry::with_config(config).unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: RowId,
    pub name: String,
    pub region: i64,
    pub email: String,
}

impl Customer {
    pub fn new(name: &str, region: i64, email: &str) -> Self {
        Customer {
            id: RowId::new(),
            name: name.to_string(),
            region,
            email: email.to_string(),
        }
    }
}

impl Record for Customer {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("Customers")
    }

    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "name" => Some(self.name.as_str().into()),
            "region" => Some(self.region.into()),
            "email" => Some(self.email.as_str().into()),
            _ => None,
        }
    }

    fn unique_indexes() -> Vec<IndexDefinition> {
        vec![
            IndexDefinition::unique("ux_customer_email", &["email"]),
            IndexDefinition::unique("ux_customer_name_region", &["name", "region"]),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: RowId,
    pub customer_id: i64,
    pub total: i64,
}

impl Order {
    pub fn new(customer_id: i64, total: i64) -> Self {
        Order {
            id: RowId::new(),
            customer_id,
            total,
        }
    }
}

impl Record for Order {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("Orders")
    }

    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "customer_id" => Some(self.customer_id.into()),
            "total" => Some(self.total.into()),
            _ => None,
        }
    }

    fn foreign_keys() -> Vec<ForeignKeyDeclaration> {
        vec![ForeignKeyDeclaration::new("Customers", "customer_id", "id")]
    }
}

/// Optional reference: customer_id 0 means "no customer"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: RowId,
    pub customer_id: i64,
    pub text: String,
}

impl Note {
    pub fn new(customer_id: i64, text: &str) -> Self {
        Note {
            id: RowId::new(),
            customer_id,
            text: text.to_string(),
        }
    }
}

impl Record for Note {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("Notes")
    }

    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "customer_id" => Some(self.customer_id.into()),
            "text" => Some(self.text.as_str().into()),
            _ => None,
        }
    }

    fn foreign_keys() -> Vec<ForeignKeyDeclaration> {
        vec![ForeignKeyDeclaration::new("Customers", "customer_id", "id").allow_default()]
    }
}

/// Self-referencing table; manager_id 0 means "reports to nobody"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub id: RowId,
    pub manager_id: i64,
}

impl Employee {
    pub fn new(manager_id: i64) -> Self {
        Employee {
            id: RowId::new(),
            manager_id,
        }
    }
}

impl Record for Employee {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("Employees")
    }

    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "manager_id" => Some(self.manager_id.into()),
            _ => None,
        }
    }

    fn foreign_keys() -> Vec<ForeignKeyDeclaration> {
        vec![ForeignKeyDeclaration::new("Employees", "manager_id", "id").allow_default()]
    }
}

/// Fixed-size row: 4 byte frame + 8 (id) + 8 + 8
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: RowId,
    pub a: i64,
    pub b: i64,
}

pub const SAMPLE_ENCODED_SIZE: u64 = 28;

impl Sample {
    pub fn new(a: i64, b: i64) -> Self {
        Sample { id: RowId::new(), a, b }
    }
}

impl Record for Sample {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("Samples").with_page_size(1024)
    }

    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "a" => Some(self.a.into()),
            "b" => Some(self.b.into()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub id: RowId,
    pub payload: String,
}

impl Record for Archive {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("Archive").with_compression(Compression::Gzip)
    }

    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "payload" => Some(self.payload.as_str().into()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: RowId,
    pub token: String,
}

impl Session {
    pub fn new(token: &str) -> Self {
        Session {
            id: RowId::new(),
            token: token.to_string(),
        }
    }
}

impl Record for Session {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("Sessions").with_caching(CachingStrategy::sliding(SESSION_TIMEOUT_MS))
    }

    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "token" => Some(self.token.as_str().into()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub id: RowId,
    pub key: String,
}

impl Record for Setting {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("Settings").with_caching(CachingStrategy::RetainForever)
    }

    fn row_id(&self) -> &RowId {
        &self.id
    }

    fn row_id_mut(&mut self) -> &mut RowId {
        &mut self.id
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "key" => Some(self.key.as_str().into()),
            _ => None,
        }
    }
}
