//! Index Set
//!
//! Enforces the unique constraints a row type declares. Each constraint
//! keeps an ordered map from composite key to row id, rebuilt whenever the
//! table's records are (re)loaded and maintained incrementally afterwards.

use crate::error::{Result, StoreError};
use crate::schema::{IndexDefinition, PropertySource};
use crate::types::{CompositeKey, IndexKey, PropertyValue};
use std::collections::{BTreeMap, HashSet};

/// One unique constraint
#[derive(Debug, Clone)]
pub struct UniqueIndex {
    pub definition: IndexDefinition,
    tree: BTreeMap<CompositeKey, i64>,
}

impl UniqueIndex {
    fn new(definition: IndexDefinition) -> Self {
        UniqueIndex {
            definition,
            tree: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Number of keys held
    pub fn size(&self) -> usize {
        self.tree.len()
    }

    pub fn lookup(&self, key: &CompositeKey) -> Option<i64> {
        self.tree.get(key).copied()
    }

    fn key_for(&self, table: &str, row: &dyn PropertySource) -> Result<CompositeKey> {
        let mut parts = Vec::with_capacity(self.definition.properties.len());
        for property in &self.definition.properties {
            let value = row.property_value(property).ok_or_else(|| {
                StoreError::Argument(format!(
                    "index '{}' on table '{}' refers to unknown property '{}'",
                    self.definition.name, table, property
                ))
            })?;
            parts.push(IndexKey::from(&value));
        }
        Ok(CompositeKey(parts))
    }
}

/// All unique constraints of one table
#[derive(Debug, Clone)]
pub struct IndexSet {
    table: String,
    indexes: Vec<UniqueIndex>,
}

impl IndexSet {
    pub fn new(table: &str, definitions: Vec<IndexDefinition>) -> Result<Self> {
        let mut names = HashSet::new();
        for definition in &definitions {
            definition.validate()?;
            if !names.insert(definition.name.clone()) {
                return Err(StoreError::Argument(format!(
                    "index {} declared twice on table '{}'",
                    definition.name, table
                )));
            }
        }

        Ok(IndexSet {
            table: table.to_string(),
            indexes: definitions.into_iter().map(UniqueIndex::new).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn indexes(&self) -> &[UniqueIndex] {
        &self.indexes
    }

    pub fn clear(&mut self) {
        for index in &mut self.indexes {
            index.tree.clear();
        }
    }

    /// Rebuild every index from a full record set
    pub fn rebuild<'a, I>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = (i64, &'a dyn PropertySource)>,
    {
        self.clear();
        for (id, row) in rows {
            self.insert(row, id)?;
        }
        Ok(())
    }

    /// Add a row's keys; nothing changes when any key is taken
    pub fn insert(&mut self, row: &dyn PropertySource, id: i64) -> Result<()> {
        let keys = self.candidate_keys(row, None)?;
        for (index, key) in self.indexes.iter_mut().zip(keys) {
            index.tree.insert(key, id);
        }
        Ok(())
    }

    /// Swap a row's keys; the row's own previous keys do not conflict
    pub fn update(&mut self, old: &dyn PropertySource, new: &dyn PropertySource, id: i64) -> Result<()> {
        let new_keys = self.candidate_keys(new, Some(id))?;
        let old_keys = self.keys_of(old)?;
        for ((index, old_key), new_key) in self.indexes.iter_mut().zip(old_keys).zip(new_keys) {
            if index.tree.get(&old_key) == Some(&id) {
                index.tree.remove(&old_key);
            }
            index.tree.insert(new_key, id);
        }
        Ok(())
    }

    /// Drop a row's keys
    pub fn remove(&mut self, row: &dyn PropertySource, id: i64) {
        for index in &mut self.indexes {
            if let Ok(key) = index.key_for(&self.table, row) {
                if index.tree.get(&key) == Some(&id) {
                    index.tree.remove(&key);
                }
            }
        }
    }

    /// Row id holding `value` on a single-property index over `property`,
    /// or `None` when no such index exists
    pub fn find_by_property(&self, property: &str, value: &PropertyValue) -> Option<Option<i64>> {
        self.indexes
            .iter()
            .find(|index| index.definition.properties.len() == 1 && index.definition.properties[0] == property)
            .map(|index| index.lookup(&CompositeKey(vec![IndexKey::from(value)])))
    }

    fn keys_of(&self, row: &dyn PropertySource) -> Result<Vec<CompositeKey>> {
        self.indexes
            .iter()
            .map(|index| index.key_for(&self.table, row))
            .collect()
    }

    fn candidate_keys(&self, row: &dyn PropertySource, owner: Option<i64>) -> Result<Vec<CompositeKey>> {
        let keys = self.keys_of(row)?;
        for (index, key) in self.indexes.iter().zip(&keys) {
            if let Some(existing) = index.tree.get(key) {
                if Some(*existing) != owner {
                    return Err(StoreError::UniqueViolation {
                        table: self.table.clone(),
                        index: index.definition.name.clone(),
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(keys)
    }
}
