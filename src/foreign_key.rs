//! Foreign Key Manager
//!
//! Registry of open tables and the relationships between them, owned by a
//! [`TableRegistry`](crate::registry::TableRegistry) and shared by every
//! table it opens.
//!
//! Checks performed for a table on behalf of its facade:
//! - insert/update: every non-exempt source value must exist on the target
//! - delete/truncate: no open dependent table may still reference a removed value
//! - update of a referenced value: treated like removal of the old value
//!
//! Checks against the calling table itself go through a local view of its
//! post-mutation record set, so a table never re-enters its own lock.

use crate::error::{Result, StoreError};
use crate::registry::TableInfo;
use crate::schema::{PropertySource, RelationshipAttributes};
use crate::types::PropertyValue;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Existence lookup over a table's live records
pub trait ValueLookup {
    fn contains_value(&self, property: &str, value: &PropertyValue) -> Result<bool>;
}

/// Type-erased view of an open table
pub trait TableHandle: ValueLookup + Send + Sync {
    fn table_name(&self) -> &str;

    fn info(&self) -> Result<TableInfo>;
}

/// Declared reference from `source_table.source_property` to
/// `target_table.target_property`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relationship {
    pub source_table: String,
    pub target_table: String,
    pub source_property: String,
    pub target_property: String,
    pub attributes: RelationshipAttributes,
}

impl Relationship {
    fn exempt(&self, value: &PropertyValue) -> bool {
        self.attributes.allows_default() && value.is_default()
    }
}

pub struct ForeignKeyManager {
    tables: RwLock<HashMap<String, Weak<dyn TableHandle>>>,
    relationships: RwLock<Vec<Relationship>>,
    gate: Mutex<()>,
}

impl ForeignKeyManager {
    pub fn new() -> Self {
        ForeignKeyManager {
            tables: RwLock::new(HashMap::new()),
            relationships: RwLock::new(Vec::new()),
            gate: Mutex::new(()),
        }
    }

    /// Add a table to the live set
    pub fn register_table(&self, table: &Arc<dyn TableHandle>) -> Result<()> {
        let name = table.table_name().to_string();
        require("table name", &name)?;

        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(&name) {
            if existing.strong_count() > 0 {
                return Err(StoreError::Argument(format!(
                    "table '{}' is already registered",
                    name
                )));
            }
        }
        tables.insert(name.clone(), Arc::downgrade(table));
        debug!(table = %name, "Registered table for referential checks");
        Ok(())
    }

    /// Remove a table from the live set. Returns whether it was present.
    pub fn unregister_table(&self, name: &str) -> Result<bool> {
        require("table name", name)?;
        let removed = self.tables.write().remove(name).is_some();
        if removed {
            debug!(table = %name, "Unregistered table from referential checks");
        }
        Ok(removed)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tables
            .read()
            .get(name)
            .map(|t| t.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Declare that `source_table.source_property` references
    /// `target_table.target_property`. Re-declaring is a no-op.
    ///
    /// Waits for gated mutations in flight; the relationship applies to
    /// mutations that start after it returns.
    pub fn add_relationship(
        &self,
        source_table: &str,
        target_table: &str,
        source_property: &str,
        target_property: &str,
        attributes: RelationshipAttributes,
    ) -> Result<()> {
        require("source table", source_table)?;
        require("target table", target_table)?;
        require("source property", source_property)?;
        require("target property", target_property)?;

        let relationship = Relationship {
            source_table: source_table.to_string(),
            target_table: target_table.to_string(),
            source_property: source_property.to_string(),
            target_property: target_property.to_string(),
            attributes,
        };

        let _gate = self.gate.lock();
        let mut relationships = self.relationships.write();
        if relationships.contains(&relationship) {
            return Ok(());
        }
        info!(
            source = %source_table,
            target = %target_table,
            source_property = %source_property,
            target_property = %target_property,
            attributes = ?attributes,
            "Added relationship"
        );
        relationships.push(relationship);
        Ok(())
    }

    pub fn relationships(&self) -> Vec<Relationship> {
        self.relationships.read().clone()
    }

    /// Whether the table is the source or target of any relationship
    pub fn is_related(&self, table: &str) -> bool {
        self.relationships
            .read()
            .iter()
            .any(|r| r.source_table == table || r.target_table == table)
    }

    /// Serializes mutations on related tables so cross-table checks cannot
    /// deadlock against each other
    pub(crate) fn integrity_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    /// Every outgoing reference of `rows` must resolve
    pub fn validate_references(
        &self,
        table: &str,
        rows: &[&dyn PropertySource],
        local: &dyn ValueLookup,
    ) -> Result<()> {
        let outgoing: Vec<Relationship> = self
            .relationships
            .read()
            .iter()
            .filter(|r| r.source_table == table)
            .cloned()
            .collect();

        for relationship in &outgoing {
            let self_reference = relationship.target_table == table;
            let mut target: Option<Arc<dyn TableHandle>> = None;

            for row in rows {
                let value = source_value(*row, table, &relationship.source_property)?;
                if relationship.exempt(&value) {
                    continue;
                }
                if !self_reference && target.is_none() {
                    target = Some(self.live_table(&relationship.target_table).ok_or_else(|| {
                        StoreError::ReferentialIntegrity(format!(
                            "table '{}' references '{}', which is not open",
                            table, relationship.target_table
                        ))
                    })?);
                }
                if !contains(target.as_ref(), local, &relationship.target_property, &value)? {
                    debug!(
                        table = %table,
                        target = %relationship.target_table,
                        value = ?value,
                        "Rejected dangling reference"
                    );
                    return Err(StoreError::ReferentialIntegrity(format!(
                        "{}.{} = {:?} has no match in {}.{}",
                        table,
                        relationship.source_property,
                        value,
                        relationship.target_table,
                        relationship.target_property
                    )));
                }
            }
        }
        Ok(())
    }

    /// No open dependent may still reference a value held by `removed`.
    ///
    /// `local` is the table after the removal; a value some remaining row
    /// still holds stays a valid target.
    pub fn validate_removal(
        &self,
        table: &str,
        removed: &[&dyn PropertySource],
        local: &dyn ValueLookup,
    ) -> Result<()> {
        for relationship in self.incoming(table) {
            let dependent = match self.dependent_lookup(&relationship, table) {
                Some(handle) => handle,
                None => continue,
            };

            for row in removed {
                let value = source_value(*row, table, &relationship.target_property)?;
                if local.contains_value(&relationship.target_property, &value)? {
                    continue;
                }
                self.ensure_unreferenced(&relationship, &value, dependent.as_ref(), local)?;
            }
        }
        Ok(())
    }

    /// Like [`ForeignKeyManager::validate_removal`] for rows whose referenced
    /// value changes on update
    pub fn validate_key_changes(
        &self,
        table: &str,
        changes: &[(&dyn PropertySource, &dyn PropertySource)],
        local: &dyn ValueLookup,
    ) -> Result<()> {
        for relationship in self.incoming(table) {
            let dependent = match self.dependent_lookup(&relationship, table) {
                Some(handle) => handle,
                None => continue,
            };

            for (old, new) in changes {
                let old_value = source_value(*old, table, &relationship.target_property)?;
                let new_value = source_value(*new, table, &relationship.target_property)?;
                if old_value == new_value
                    || local.contains_value(&relationship.target_property, &old_value)?
                {
                    continue;
                }
                self.ensure_unreferenced(&relationship, &old_value, dependent.as_ref(), local)?;
            }
        }
        Ok(())
    }

    fn incoming(&self, table: &str) -> Vec<Relationship> {
        self.relationships
            .read()
            .iter()
            .filter(|r| r.target_table == table)
            .cloned()
            .collect()
    }

    /// `None`: dependent not open, skip. `Some(None)`: the table itself.
    fn dependent_lookup(
        &self,
        relationship: &Relationship,
        table: &str,
    ) -> Option<Option<Arc<dyn TableHandle>>> {
        if relationship.source_table == table {
            Some(None)
        } else {
            self.live_table(&relationship.source_table).map(Some)
        }
    }

    fn ensure_unreferenced(
        &self,
        relationship: &Relationship,
        value: &PropertyValue,
        dependent: Option<&Arc<dyn TableHandle>>,
        local: &dyn ValueLookup,
    ) -> Result<()> {
        if relationship.exempt(value) {
            return Ok(());
        }
        if contains(dependent, local, &relationship.source_property, value)? {
            debug!(
                table = %relationship.target_table,
                dependent = %relationship.source_table,
                value = ?value,
                "Rejected removal of referenced value"
            );
            return Err(StoreError::ReferentialIntegrity(format!(
                "{}.{} = {:?} is still referenced by {}.{}",
                relationship.target_table,
                relationship.target_property,
                value,
                relationship.source_table,
                relationship.source_property
            )));
        }
        Ok(())
    }

    fn live_table(&self, name: &str) -> Option<Arc<dyn TableHandle>> {
        self.tables.read().get(name).and_then(Weak::upgrade)
    }
}

impl Default for ForeignKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Look a value up on another open table, or on the calling table's local view
fn contains(
    table: Option<&Arc<dyn TableHandle>>,
    local: &dyn ValueLookup,
    property: &str,
    value: &PropertyValue,
) -> Result<bool> {
    match table {
        Some(handle) => handle.contains_value(property, value),
        None => local.contains_value(property, value),
    }
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StoreError::Argument(format!("{} is required", what)));
    }
    Ok(())
}

fn source_value(row: &dyn PropertySource, table: &str, property: &str) -> Result<PropertyValue> {
    row.property_value(property).ok_or_else(|| {
        StoreError::Argument(format!(
            "rows of table '{}' have no property '{}'",
            table, property
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CachingStrategy;
    use std::collections::HashSet;
    use std::path::PathBuf;

    struct FakeTable {
        name: String,
        values: HashSet<i64>,
    }

    impl ValueLookup for FakeTable {
        fn contains_value(&self, _property: &str, value: &PropertyValue) -> Result<bool> {
            Ok(value.as_i64().map(|v| self.values.contains(&v)).unwrap_or(false))
        }
    }

    impl TableHandle for FakeTable {
        fn table_name(&self) -> &str {
            &self.name
        }

        fn info(&self) -> Result<TableInfo> {
            Ok(TableInfo {
                name: self.name.clone(),
                path: PathBuf::new(),
                record_count: self.values.len() as i64,
                data_length: 0,
                stored_length: 0,
                page_count: 0,
                caching: CachingStrategy::None,
                loaded: true,
            })
        }
    }

    struct Row(i64);

    impl PropertySource for Row {
        fn property_value(&self, _name: &str) -> Option<PropertyValue> {
            Some(PropertyValue::Int(self.0))
        }
    }

    fn fake(name: &str, values: &[i64]) -> Arc<FakeTable> {
        Arc::new(FakeTable {
            name: name.to_string(),
            values: values.iter().copied().collect(),
        })
    }

    fn handle(table: &Arc<FakeTable>) -> Arc<dyn TableHandle> {
        table.clone()
    }

    #[test]
    fn test_register_duplicate_fails() {
        let manager = ForeignKeyManager::new();
        let table = handle(&fake("Customers", &[]));
        manager.register_table(&table).unwrap();
        assert!(manager.register_table(&table).unwrap_err().is_argument());

        assert!(manager.unregister_table("Customers").unwrap());
        assert!(!manager.is_registered("Customers"));
        manager.register_table(&table).unwrap();
    }

    #[test]
    fn test_required_parameters() {
        let manager = ForeignKeyManager::new();
        let result = manager.add_relationship("Orders", "", "customer_id", "id", RelationshipAttributes::Normal);
        assert!(result.unwrap_err().is_argument());
        assert!(manager.unregister_table("").is_err());
    }

    #[test]
    fn test_references_checked_against_target() {
        let manager = ForeignKeyManager::new();
        let customers = fake("Customers", &[1, 2]);
        let orders = fake("Orders", &[]);
        manager.register_table(&handle(&customers)).unwrap();
        manager
            .add_relationship("Orders", "Customers", "customer_id", "id", RelationshipAttributes::Normal)
            .unwrap();

        manager.validate_references("Orders", &[&Row(2)], orders.as_ref()).unwrap();
        let err = manager.validate_references("Orders", &[&Row(9)], orders.as_ref()).unwrap_err();
        assert!(err.is_referential());
    }

    #[test]
    fn test_default_value_exemption() {
        let manager = ForeignKeyManager::new();
        let customers = fake("Customers", &[1]);
        let notes = fake("Notes", &[]);
        manager.register_table(&handle(&customers)).unwrap();
        manager
            .add_relationship("Notes", "Customers", "customer_id", "id", RelationshipAttributes::AllowDefaultValue)
            .unwrap();

        manager.validate_references("Notes", &[&Row(0)], notes.as_ref()).unwrap();
        assert!(manager.validate_references("Notes", &[&Row(5)], notes.as_ref()).is_err());

        // exempt values need no open target
        manager.unregister_table("Customers").unwrap();
        manager.validate_references("Notes", &[&Row(0)], notes.as_ref()).unwrap();
    }

    #[test]
    fn test_closed_target_rejects_references() {
        let manager = ForeignKeyManager::new();
        let orders = fake("Orders", &[]);
        manager
            .add_relationship("Orders", "Customers", "customer_id", "id", RelationshipAttributes::Normal)
            .unwrap();
        let err = manager.validate_references("Orders", &[&Row(1)], orders.as_ref()).unwrap_err();
        assert!(err.is_referential());
    }

    #[test]
    fn test_removal_blocked_by_dependent() {
        let manager = ForeignKeyManager::new();
        let customers = fake("Customers", &[1, 2]);
        let orders = fake("Orders", &[2]);
        manager.register_table(&handle(&customers)).unwrap();
        manager.register_table(&handle(&orders)).unwrap();
        manager
            .add_relationship("Orders", "Customers", "customer_id", "id", RelationshipAttributes::Normal)
            .unwrap();

        // lookups see the table after the removal
        let without_one = fake("Customers", &[2]);
        let without_two = fake("Customers", &[1]);
        manager.validate_removal("Customers", &[&Row(1)], without_one.as_ref()).unwrap();
        let err = manager.validate_removal("Customers", &[&Row(2)], without_two.as_ref()).unwrap_err();
        assert!(err.is_referential());

        // unchanged value passes, changed value fails
        manager
            .validate_key_changes("Customers", &[(&Row(2), &Row(2))], customers.as_ref())
            .unwrap();
        let changed = fake("Customers", &[1, 3]);
        assert!(manager
            .validate_key_changes("Customers", &[(&Row(2), &Row(3))], changed.as_ref())
            .is_err());
    }

    #[test]
    fn test_removal_allowed_while_value_remains() {
        let manager = ForeignKeyManager::new();
        let shipments = fake("Shipments", &[7]);
        manager.register_table(&handle(&shipments)).unwrap();
        manager
            .add_relationship("Shipments", "Customers", "region", "region", RelationshipAttributes::Normal)
            .unwrap();

        // another customer still sits in region 7
        let remaining = fake("Customers", &[7]);
        manager.validate_removal("Customers", &[&Row(7)], remaining.as_ref()).unwrap();
        manager
            .validate_key_changes("Customers", &[(&Row(7), &Row(8))], remaining.as_ref())
            .unwrap();

        let emptied = fake("Customers", &[8]);
        assert!(manager
            .validate_removal("Customers", &[&Row(7)], emptied.as_ref())
            .unwrap_err()
            .is_referential());
    }

    #[test]
    fn test_add_relationship_waits_for_gate() {
        let manager = Arc::new(ForeignKeyManager::new());
        let gate = manager.integrity_gate();

        let adder = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                manager.add_relationship("Orders", "Customers", "customer_id", "id", RelationshipAttributes::Normal)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!manager.is_related("Customers"));

        drop(gate);
        adder.join().unwrap().unwrap();
        assert!(manager.is_related("Customers"));
    }

    #[test]
    fn test_relationship_redeclaration_is_idempotent() {
        let manager = ForeignKeyManager::new();
        for _ in 0..3 {
            manager
                .add_relationship("Orders", "Customers", "customer_id", "id", RelationshipAttributes::Normal)
                .unwrap();
        }
        assert_eq!(manager.relationships().len(), 1);
        assert!(manager.is_related("Customers"));
        assert!(!manager.is_related("Invoices"));
    }
}
