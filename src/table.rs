//! Table Operations Facade
//!
//! `Table<R>` is the public API for one row type. It owns the table file
//! through a shared core that is also reachable by the foreign key manager
//! (existence lookups) and the cache sweeper (idle eviction).
//!
//! Every mutation runs as one critical section under the table's write lock:
//!
//! ```text
//! stage ids -> index check -> apply in memory -> referential check -> rewrite file
//! ```
//!
//! Any failure rolls the in-memory state back; the file header only changes
//! once the rewrite has been synced, so the durable state is untouched.
//! Mutations on tables that take part in a relationship additionally hold
//! the registry's integrity gate, taken before the table lock.

use crate::cache::{AccessTracker, ClearReason, Evictable, MemoryCleared};
use crate::codec::{decode_records, encode_records, RecordCodec};
use crate::error::{Result, StoreError};
use crate::foreign_key::{TableHandle, ValueLookup};
use crate::index::IndexSet;
use crate::registry::{TableInfo, TableRegistry};
use crate::schema::{CachingStrategy, IndexDefinition, PropertySource, Record, TableDescriptor, ID_PROPERTY};
use crate::storage::{FileHeader, TableFile};
use crate::timing::Operation;
use crate::types::{PropertyValue, SENTINEL_ID};
use parking_lot::{MutexGuard, RwLock, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest the sweeper waits for a busy table before skipping it
const EVICTION_LOCK_WAIT: Duration = Duration::from_millis(50);

/// Notification raised after every successful mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEvent {
    pub table: String,
    pub operation: Operation,
    /// Rows touched by the call (0 for sequence operations)
    pub rows: usize,
    pub elapsed: Duration,
}

type OperationListener<R> = Arc<dyn Fn(&Table<R>, &OperationEvent) + Send + Sync>;
type MemoryListener = Arc<dyn Fn(&MemoryCleared) + Send + Sync>;

/// Undo journal entry for an in-memory change
enum Change<R> {
    Appended(usize),
    Replaced(Vec<(usize, R)>),
    Removed(Vec<(usize, R)>),
    Cleared(Vec<R>),
}

/// Decoded live set of a table
#[derive(Debug)]
struct LoadedRecords<R> {
    rows: Vec<R>,
    positions: HashMap<i64, usize>,
    indexes: IndexSet,
}

impl<R: Record> LoadedRecords<R> {
    fn new(rows: Vec<R>, indexes: IndexSet) -> Result<Self> {
        let mut records = LoadedRecords {
            rows,
            positions: HashMap::new(),
            indexes,
        };
        records.reindex()?;
        Ok(records)
    }

    fn get(&self, id: i64) -> Option<&R> {
        self.positions.get(&id).map(|&pos| &self.rows[pos])
    }

    fn rebuild_positions(&mut self) -> Result<()> {
        self.positions.clear();
        self.positions.reserve(self.rows.len());
        for (pos, row) in self.rows.iter().enumerate() {
            if self.positions.insert(row.id(), pos).is_some() {
                return Err(StoreError::InvariantViolation(format!(
                    "row id {} occurs more than once",
                    row.id()
                )));
            }
        }
        Ok(())
    }

    fn reindex(&mut self) -> Result<()> {
        self.rebuild_positions()?;
        self.indexes
            .rebuild(self.rows.iter().map(|r| (r.id(), r as &dyn PropertySource)))
    }

    fn append(&mut self, rows: Vec<R>, journal: &mut Vec<Change<R>>) -> Result<()> {
        journal.push(Change::Appended(self.rows.len()));
        for row in rows {
            let id = row.id();
            self.indexes.insert(&row, id)?;
            self.positions.insert(id, self.rows.len());
            self.rows.push(row);
        }
        Ok(())
    }

    fn replace(&mut self, rows: Vec<R>, journal: &mut Vec<Change<R>>) -> Result<()> {
        let mut previous = Vec::with_capacity(rows.len());
        let mut outcome = Ok(());
        for row in rows {
            let id = row.id();
            let pos = match self.positions.get(&id) {
                Some(&pos) => pos,
                None => {
                    outcome = Err(StoreError::Argument(format!("row {} is not in the table", id)));
                    break;
                }
            };
            if let Err(e) = self.indexes.update(&self.rows[pos], &row, id) {
                outcome = Err(e);
                break;
            }
            previous.push((pos, std::mem::replace(&mut self.rows[pos], row)));
        }
        journal.push(Change::Replaced(previous));
        outcome
    }

    fn remove(&mut self, ids: &HashSet<i64>, journal: &mut Vec<Change<R>>) -> Result<()> {
        let mut removed = Vec::with_capacity(ids.len());
        let mut kept = Vec::with_capacity(self.rows.len().saturating_sub(ids.len()));
        for (pos, row) in std::mem::take(&mut self.rows).into_iter().enumerate() {
            if ids.contains(&row.id()) {
                self.indexes.remove(&row, row.id());
                removed.push((pos, row));
            } else {
                kept.push(row);
            }
        }
        self.rows = kept;
        journal.push(Change::Removed(removed));
        self.rebuild_positions()
    }

    fn clear(&mut self, journal: &mut Vec<Change<R>>) {
        journal.push(Change::Cleared(std::mem::take(&mut self.rows)));
        self.positions.clear();
        self.indexes.clear();
    }

    /// Undo `journal` and restore positions and indexes
    fn rollback(&mut self, table: &str, journal: Vec<Change<R>>) {
        for change in journal.into_iter().rev() {
            match change {
                Change::Appended(from) => self.rows.truncate(from),
                Change::Replaced(previous) => {
                    for (pos, row) in previous.into_iter().rev() {
                        self.rows[pos] = row;
                    }
                }
                Change::Removed(removed) => {
                    for (pos, row) in removed {
                        self.rows.insert(pos, row);
                    }
                }
                Change::Cleared(rows) => self.rows = rows,
            }
        }
        if let Err(e) = self.reindex() {
            error!(table = %table, error = %e, "Failed to reindex after rollback");
        }
    }
}

impl<R: Record> ValueLookup for LoadedRecords<R> {
    fn contains_value(&self, property: &str, value: &PropertyValue) -> Result<bool> {
        if property == ID_PROPERTY {
            return Ok(value
                .as_i64()
                .map(|id| self.positions.contains_key(&id))
                .unwrap_or(false));
        }
        if let Some(found) = self.indexes.find_by_property(property, value) {
            return Ok(found.is_some());
        }
        Ok(self
            .rows
            .iter()
            .any(|row| row.property_value(property).as_ref() == Some(value)))
    }
}

struct TableState<R> {
    file: TableFile,
    /// `None` while evicted
    records: Option<LoadedRecords<R>>,
}

/// Shared part of a table, reachable from the registry and the sweeper
pub(crate) struct TableCore<R: Record> {
    name: String,
    descriptor: TableDescriptor,
    index_definitions: Vec<IndexDefinition>,
    codec: RecordCodec,
    state: RwLock<Option<TableState<R>>>,
    tracker: AccessTracker,
    memory_listeners: RwLock<Vec<MemoryListener>>,
}

impl<R: Record> TableCore<R> {
    fn disposed(&self) -> StoreError {
        StoreError::Disposed(self.name.clone())
    }

    fn load(&self, state: &mut TableState<R>) -> Result<()> {
        if state.records.is_some() {
            return Ok(());
        }

        let started = Instant::now();
        let path = state.file.path().to_path_buf();
        let header = state.file.header().clone();
        let stored = state.file.read_block()?;
        let block = self
            .codec
            .unseal(&stored)
            .map_err(|e| StoreError::corruption(&path, format!("record block unreadable: {}", e)))?;
        if block.len() as u64 != header.data_length as u64 {
            return Err(StoreError::corruption(
                &path,
                format!(
                    "record block is {} bytes, header claims {}",
                    block.len(),
                    header.data_length
                ),
            ));
        }

        let rows: Vec<R> = decode_records(&block)
            .map_err(|e| StoreError::corruption(&path, e.to_string()))?;
        if rows.len() as u64 != header.record_count as u64 {
            return Err(StoreError::corruption(
                &path,
                format!(
                    "decoded {} records, header claims {}",
                    rows.len(),
                    header.record_count
                ),
            ));
        }

        let indexes = IndexSet::new(&self.name, self.index_definitions.clone())?;
        let records = LoadedRecords::new(rows, indexes)
            .map_err(|e| StoreError::corruption(&path, e.to_string()))?;

        debug!(
            table = %self.name,
            records = records.rows.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Loaded records"
        );
        state.records = Some(records);
        Ok(())
    }

    /// Run `f` over the loaded records under the shared lock, reloading
    /// evicted records first
    fn read<T>(&self, f: impl FnOnce(&LoadedRecords<R>) -> Result<T>) -> Result<T> {
        self.tracker.touch();
        {
            let guard = self.state.read();
            let state = guard.as_ref().ok_or_else(|| self.disposed())?;
            if let Some(records) = &state.records {
                return f(records);
            }
        }

        let mut guard = self.state.write();
        {
            let state = guard.as_mut().ok_or_else(|| self.disposed())?;
            self.load(state)?;
        }
        let guard = RwLockWriteGuard::downgrade(guard);
        let records = guard
            .as_ref()
            .and_then(|state| state.records.as_ref())
            .ok_or_else(|| self.disposed())?;
        f(records)
    }

    /// Run `f` over the file metadata without loading records
    fn inspect<T>(&self, f: impl FnOnce(&TableState<R>) -> T) -> Result<T> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.disposed())?;
        Ok(f(state))
    }

    /// Run `f` under the exclusive lock with records loaded
    fn write<T>(&self, f: impl FnOnce(&mut TableFile, &mut LoadedRecords<R>) -> Result<T>) -> Result<T> {
        self.tracker.touch();
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or_else(|| self.disposed())?;
        self.load(state)?;
        let records = state.records.as_mut().ok_or_else(|| self.disposed())?;
        let result = f(&mut state.file, records);
        self.tracker.touch();
        result
    }

    /// Run `f` over the file header only (sequence operations)
    fn write_header<T>(&self, f: impl FnOnce(&mut FileHeader) -> Result<T>) -> Result<T> {
        self.tracker.touch();
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or_else(|| self.disposed())?;
        let mut header = state.file.header().clone();
        let value = f(&mut header)?;
        state.file.write_header(header)?;
        Ok(value)
    }

    /// Rewrite the file from the in-memory live set
    fn persist(&self, file: &mut TableFile, mut header: FileHeader, rows: &[R]) -> Result<()> {
        let block = encode_records(rows)?;
        let sealed = self.codec.seal(&block)?;
        header.record_count = to_i32("record count", rows.len())?;
        header.data_length = to_i32("data length", block.len())?;
        header.stored_length = to_i32("stored length", sealed.len())?;
        file.write(header, &sealed)
    }

    fn clear_memory(&self, reason: ClearReason) -> Result<bool> {
        let released = {
            let mut guard = self.state.write();
            let state = guard.as_mut().ok_or_else(|| self.disposed())?;
            match state.records.take() {
                Some(records) => records.rows.len(),
                None => return Ok(false),
            }
        };
        self.memory_cleared(reason, released);
        Ok(true)
    }

    fn memory_cleared(&self, reason: ClearReason, records_released: usize) {
        info!(
            table = %self.name,
            reason = ?reason,
            records = records_released,
            "Cleared in-memory records"
        );
        let event = MemoryCleared {
            table: self.name.clone(),
            reason,
            records_released,
        };
        let listeners = self.memory_listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }

    fn info(&self) -> Result<TableInfo> {
        self.inspect(|state| {
            let header = state.file.header();
            TableInfo {
                name: self.name.clone(),
                path: state.file.path().to_path_buf(),
                record_count: header.record_count as i64,
                data_length: header.data_length as u64,
                stored_length: header.stored_length as u64,
                page_count: state.file.page_count(),
                caching: self.descriptor.caching,
                loaded: state.records.is_some(),
            }
        })
    }
}

impl<R: Record> ValueLookup for TableCore<R> {
    fn contains_value(&self, property: &str, value: &PropertyValue) -> Result<bool> {
        self.read(|records| records.contains_value(property, value))
    }
}

impl<R: Record> TableHandle for TableCore<R> {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> Result<TableInfo> {
        TableCore::info(self)
    }
}

impl<R: Record> Evictable for TableCore<R> {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn evict_if_idle(&self, now: Instant) -> bool {
        if !self.tracker.is_expired(now) {
            return false;
        }

        let released = {
            let mut guard = match self.state.try_write_for(EVICTION_LOCK_WAIT) {
                Some(guard) => guard,
                None => {
                    debug!(table = %self.name, "Table busy, eviction skipped");
                    return false;
                }
            };
            // an access may have re-armed the timer while we waited
            if !self.tracker.is_expired(Instant::now()) {
                return false;
            }
            match guard.as_mut().and_then(|state| state.records.take()) {
                Some(records) => records.rows.len(),
                None => return false,
            }
        };

        self.memory_cleared(ClearReason::IdleTimeout, released);
        true
    }
}

/// Typed operations on one table
pub struct Table<R: Record> {
    core: Arc<TableCore<R>>,
    registry: Arc<TableRegistry>,
    listeners: RwLock<Vec<OperationListener<R>>>,
}

impl<R: Record> Table<R> {
    /// Open (or create) the table file for `R` under the registry root
    pub fn open(registry: &Arc<TableRegistry>) -> Result<Self> {
        let started = Instant::now();
        let descriptor = R::descriptor();
        descriptor.validate()?;
        let name = descriptor.name.clone();
        registry.check_available(&name)?;

        let index_definitions = R::unique_indexes();
        IndexSet::new(&name, index_definitions.clone())?;

        let config = registry.config();
        let page_size = descriptor.page_size.unwrap_or(config.default_page_size);
        let path: PathBuf = config.table_path(&name);
        let initial = FileHeader::new(descriptor.version, page_size, descriptor.compression);
        let (file, created) = TableFile::open_or_create(&path, initial, config.min_supported_version)?;

        let compression = file.header().compression();
        if compression != descriptor.compression {
            warn!(
                table = %name,
                stored = ?compression,
                declared = ?descriptor.compression,
                "Table file uses a different compression than declared; keeping the stored one"
            );
        }

        let core = Arc::new(TableCore {
            name: name.clone(),
            codec: registry.codec_for(compression),
            tracker: AccessTracker::new(descriptor.caching.timeout()),
            descriptor,
            index_definitions,
            state: RwLock::new(Some(TableState { file, records: None })),
            memory_listeners: RwLock::new(Vec::new()),
        });

        {
            let mut guard = core.state.write();
            if let Some(state) = guard.as_mut() {
                core.load(state)?;
            }
        }

        let handle: Arc<dyn TableHandle> = core.clone();
        let evictable: Option<Arc<dyn Evictable>> = match core.descriptor.caching {
            CachingStrategy::SlidingTimeout { .. } => Some(core.clone() as Arc<dyn Evictable>),
            _ => None,
        };
        registry.register_table(&handle, evictable.as_ref())?;

        let table = Table {
            core,
            registry: Arc::clone(registry),
            listeners: RwLock::new(Vec::new()),
        };

        for foreign_key in R::foreign_keys() {
            registry.foreign_keys().add_relationship(
                &name,
                &foreign_key.target_table,
                &foreign_key.source_property,
                &foreign_key.target_property,
                foreign_key.attributes,
            )?;
        }

        let info = table.core.info()?;
        info!(
            table = %name,
            path = %info.path.display(),
            created,
            records = info.record_count,
            caching = ?info.caching,
            "Opened table"
        );
        registry.table_opened(&info);
        registry.timings().record(&name, Operation::Open, started.elapsed());
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.core.descriptor
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Insert one row, assigning its id when it carries the sentinel
    pub fn insert(&self, row: &mut R) -> Result<()> {
        self.insert_many(std::slice::from_mut(row))
    }

    /// Insert a batch atomically
    pub fn insert_many(&self, rows: &mut [R]) -> Result<()> {
        self.timed(Operation::Insert, rows.len(), || {
            let inserts: Vec<R> = rows.to_vec();
            let ids = self.commit(inserts, Vec::new())?;
            for (row, id) in rows.iter_mut().zip(ids) {
                row.row_id_mut().assign(id);
            }
            Ok(())
        })
    }

    /// Replace a live row matched by id
    pub fn update(&self, row: &R) -> Result<()> {
        self.update_many(std::slice::from_ref(row))
    }

    pub fn update_many(&self, rows: &[R]) -> Result<()> {
        self.timed(Operation::Update, rows.len(), || {
            self.commit(Vec::new(), rows.to_vec()).map(|_| ())
        })
    }

    /// Insert when the row carries the sentinel id, update otherwise
    pub fn insert_or_update(&self, row: &mut R) -> Result<()> {
        self.insert_or_update_many(std::slice::from_mut(row))
    }

    pub fn insert_or_update_many(&self, rows: &mut [R]) -> Result<()> {
        self.timed(Operation::InsertOrUpdate, rows.len(), || {
            let mut inserts = Vec::new();
            let mut slots = Vec::new();
            let mut updates = Vec::new();
            for (slot, row) in rows.iter().enumerate() {
                if row.row_id().is_sentinel() {
                    inserts.push(row.clone());
                    slots.push(slot);
                } else {
                    updates.push(row.clone());
                }
            }

            let ids = self.commit(inserts, updates)?;
            for (slot, id) in slots.into_iter().zip(ids) {
                rows[slot].row_id_mut().assign(id);
            }
            Ok(())
        })
    }

    /// Remove a live row matched by id
    pub fn delete(&self, row: &R) -> Result<()> {
        self.delete_many(std::slice::from_ref(row))
    }

    pub fn delete_many(&self, rows: &[R]) -> Result<()> {
        let ids: Vec<i64> = rows.iter().map(|r| r.id()).collect();
        self.delete_ids(&ids)
    }

    /// Remove live rows by id
    pub fn delete_ids(&self, ids: &[i64]) -> Result<()> {
        self.timed(Operation::Delete, ids.len(), || {
            let gate = self.integrity_gate();
            let related = gate.is_some();
            let name = self.name();
            self.core.write(|file, records| {
                let mut targets = HashSet::with_capacity(ids.len());
                for &id in ids {
                    if !records.positions.contains_key(&id) {
                        return Err(StoreError::Argument(format!(
                            "row {} is not in table '{}'",
                            id, name
                        )));
                    }
                    if !targets.insert(id) {
                        return Err(StoreError::Argument(format!(
                            "row {} appears twice in the batch",
                            id
                        )));
                    }
                }

                let header = file.header().clone();
                let mut journal = Vec::new();
                let result = records.remove(&targets, &mut journal).and_then(|_| {
                    if related {
                        let removed = removed_rows(&journal);
                        self.registry
                            .foreign_keys()
                            .validate_removal(name, &removed, &*records)?;
                    }
                    self.core.persist(file, header, &records.rows)
                });
                if let Err(e) = result {
                    records.rollback(name, journal);
                    return Err(e);
                }
                debug!(table = %name, deleted = ids.len(), "Deleted rows");
                Ok(())
            })
        })
    }

    /// Remove every row; sequences are left alone
    pub fn truncate(&self) -> Result<()> {
        let count = self.record_count()? as usize;
        self.timed(Operation::Truncate, count, || {
            let gate = self.integrity_gate();
            let related = gate.is_some();
            let name = self.name();
            self.core.write(|file, records| {
                let header = file.header().clone();
                let mut journal = Vec::new();
                records.clear(&mut journal);

                let result = {
                    let removed = removed_rows(&journal);
                    let checked = if related {
                        self.registry
                            .foreign_keys()
                            .validate_removal(name, &removed, &*records)
                    } else {
                        Ok(())
                    };
                    checked.and_then(|_| self.core.persist(file, header, &records.rows))
                };
                if let Err(e) = result {
                    records.rollback(name, journal);
                    return Err(e);
                }
                info!(table = %name, "Truncated table");
                Ok(())
            })
        })
    }

    /// The full live set in load/insert order
    pub fn select(&self) -> Result<Vec<R>> {
        self.timed(Operation::Select, 0, || self.core.read(|records| Ok(records.rows.clone())))
    }

    /// The row with `id`, or `None`
    pub fn select_id(&self, id: i64) -> Result<Option<R>> {
        self.timed(Operation::Select, 1, || {
            self.core.read(|records| Ok(records.get(id).cloned()))
        })
    }

    /// Live rows matching `predicate`
    pub fn select_where(&self, predicate: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        self.timed(Operation::Select, 0, || {
            self.core
                .read(|records| Ok(records.rows.iter().filter(|r| predicate(r)).cloned().collect()))
        })
    }

    pub fn contains(&self, id: i64) -> Result<bool> {
        self.core.read(|records| Ok(records.positions.contains_key(&id)))
    }

    /// Increment and persist the primary sequence
    pub fn next_sequence(&self) -> Result<i64> {
        self.timed(Operation::NextSequence, 0, || {
            self.core.write_header(|header| header.sequences.next_primary())
        })
    }

    /// Add `delta` to the secondary sequence and persist it
    pub fn next_secondary_sequence(&self, delta: i64) -> Result<i64> {
        self.timed(Operation::NextSecondarySequence, 0, || {
            self.core
                .write_header(|header| header.sequences.advance_secondary(delta))
        })
    }

    /// Overwrite both sequences
    pub fn reset_sequence(&self, primary: i64, secondary: i64) -> Result<()> {
        self.timed(Operation::ResetSequence, 0, || {
            self.core.write_header(|header| {
                header.sequences.reset(primary, secondary);
                Ok(())
            })?;
            info!(table = %self.name(), primary, secondary, "Reset sequences");
            Ok(())
        })
    }

    pub fn record_count(&self) -> Result<i64> {
        self.core.inspect(|s| s.file.header().record_count as i64)
    }

    /// Uncompressed record block length
    pub fn data_length(&self) -> Result<u64> {
        self.core.inspect(|s| s.file.header().data_length as u64)
    }

    /// Record block length on disk
    pub fn stored_length(&self) -> Result<u64> {
        self.core.inspect(|s| s.file.header().stored_length as u64)
    }

    pub fn primary_sequence(&self) -> Result<i64> {
        self.core.inspect(|s| s.file.header().sequences.primary)
    }

    pub fn secondary_sequence(&self) -> Result<i64> {
        self.core.inspect(|s| s.file.header().sequences.secondary)
    }

    pub fn file_version(&self) -> Result<u16> {
        self.core.inspect(|s| s.file.header().file_version)
    }

    pub fn page_size(&self) -> Result<i32> {
        self.core.inspect(|s| s.file.header().page_size)
    }

    pub fn page_count(&self) -> Result<u64> {
        self.core.inspect(|s| s.file.page_count())
    }

    pub fn allocated_page_count(&self) -> Result<u64> {
        self.core.inspect(|s| s.file.allocated_pages())
    }

    pub fn compact_percent(&self) -> Result<f64> {
        self.core.inspect(|s| s.file.compact_percent())
    }

    /// Trim the file's page area; returns the bytes released
    pub fn compact(&self) -> Result<u64> {
        self.timed(Operation::Compact, 0, || {
            let mut guard = self.core.state.write();
            let state = guard.as_mut().ok_or_else(|| self.core.disposed())?;
            state.file.compact()
        })
    }

    pub fn is_loaded(&self) -> Result<bool> {
        self.core.inspect(|s| s.records.is_some())
    }

    /// Drop the decoded records now; they reload on next access.
    /// Retain-forever tables refuse and return `false`.
    pub fn release_memory(&self) -> Result<bool> {
        if self.core.descriptor.caching == CachingStrategy::RetainForever {
            self.core.inspect(|_| ())?;
            return Ok(false);
        }
        self.core.clear_memory(ClearReason::Requested)
    }

    pub fn on_memory_cleared(&self, listener: impl Fn(&MemoryCleared) + Send + Sync + 'static) {
        self.core.memory_listeners.write().push(Arc::new(listener));
    }

    pub fn on_operation_completed(
        &self,
        listener: impl Fn(&Table<R>, &OperationEvent) + Send + Sync + 'static,
    ) {
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn info(&self) -> Result<TableInfo> {
        self.core.info()
    }

    pub fn is_closed(&self) -> bool {
        self.core.state.read().is_none()
    }

    /// Release the file and leave the registry. Later calls fail with
    /// [`StoreError::Disposed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let state = self.core.state.write().take();
        let state = match state {
            Some(state) => state,
            None => return Ok(()),
        };
        let path = state.file.path().to_path_buf();
        drop(state);

        self.registry.unregister_table(self.name());
        info!(table = %self.name(), path = %path.display(), "Closed table");
        Ok(())
    }

    /// Stage, validate and persist inserts and updates as one unit.
    /// Returns the ids given to `inserts`, in order.
    fn commit(&self, inserts: Vec<R>, updates: Vec<R>) -> Result<Vec<i64>> {
        let gate = self.integrity_gate();
        let related = gate.is_some();
        let name = self.name();
        self.core.write(|file, records| {
            let mut header = file.header().clone();
            let mut claimed: HashSet<i64> = HashSet::with_capacity(inserts.len() + updates.len());

            for row in &updates {
                let id = row.id();
                if !records.positions.contains_key(&id) {
                    return Err(StoreError::Argument(format!(
                        "row {} is not in table '{}'",
                        id, name
                    )));
                }
                if !claimed.insert(id) {
                    return Err(StoreError::Argument(format!(
                        "row {} appears twice in the batch",
                        id
                    )));
                }
            }

            let mut staged = inserts;
            let mut ids = Vec::with_capacity(staged.len());
            for row in staged.iter_mut() {
                let id = if row.row_id().is_sentinel() {
                    loop {
                        let candidate = header.sequences.next_primary()?;
                        if !records.positions.contains_key(&candidate) && !claimed.contains(&candidate) {
                            break candidate;
                        }
                    }
                } else {
                    let id = row.id();
                    if id < SENTINEL_ID {
                        return Err(StoreError::Argument(format!("row id {} is negative", id)));
                    }
                    if records.positions.contains_key(&id) || claimed.contains(&id) {
                        return Err(StoreError::Argument(format!(
                            "row id {} already exists in table '{}'",
                            id, name
                        )));
                    }
                    // ids at or below the primary sequence were handed out before
                    if id <= header.sequences.primary {
                        return Err(StoreError::Argument(format!(
                            "row id {} was already allocated in table '{}' (sequence at {})",
                            id, name, header.sequences.primary
                        )));
                    }
                    header.sequences.observe(id);
                    id
                };
                claimed.insert(id);
                row.row_id_mut().assign(id);
                ids.push(id);
            }

            let mut updates = updates;
            for row in updates.iter_mut() {
                let id = row.id();
                row.row_id_mut().assign(id);
            }

            let previous: Vec<R> = updates
                .iter()
                .filter_map(|row| records.get(row.id()).cloned())
                .collect();

            let mut journal = Vec::new();
            let result = records
                .replace(updates, &mut journal)
                .and_then(|_| records.append(staged, &mut journal))
                .and_then(|_| {
                    if related {
                        self.validate_references(name, records, &previous, &ids)
                    } else {
                        Ok(())
                    }
                })
                .and_then(|_| self.core.persist(file, header, &records.rows));

            if let Err(e) = result {
                records.rollback(name, journal);
                debug!(table = %name, error = %e, "Rolled back mutation");
                return Err(e);
            }
            Ok(ids)
        })
    }

    /// Outgoing references of inserted and updated rows, then incoming
    /// references to values an update changed
    fn validate_references(
        &self,
        name: &str,
        records: &LoadedRecords<R>,
        previous: &[R],
        inserted: &[i64],
    ) -> Result<()> {
        let foreign_keys = self.registry.foreign_keys();
        let mut written: Vec<&dyn PropertySource> = Vec::with_capacity(previous.len() + inserted.len());
        let mut changes: Vec<(&dyn PropertySource, &dyn PropertySource)> = Vec::with_capacity(previous.len());
        for old in previous {
            if let Some(new) = records.get(old.id()) {
                written.push(new);
                changes.push((old as &dyn PropertySource, new as &dyn PropertySource));
            }
        }
        for id in inserted {
            if let Some(row) = records.get(*id) {
                written.push(row);
            }
        }

        foreign_keys.validate_references(name, &written, records)?;
        foreign_keys.validate_key_changes(name, &changes, records)
    }

    /// The integrity gate if this table takes part in a relationship,
    /// decided while holding it. `None` means the mutation skips every
    /// reference check.
    fn integrity_gate(&self) -> Option<MutexGuard<'_, ()>> {
        let foreign_keys = self.registry.foreign_keys();
        let gate = foreign_keys.integrity_gate();
        if foreign_keys.is_related(self.name()) {
            Some(gate)
        } else {
            None
        }
    }

    fn timed<T>(&self, operation: Operation, rows: usize, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        if result.is_ok() {
            self.registry.timings().record(self.name(), operation, elapsed);
            if operation.is_mutation() {
                self.operation_completed(OperationEvent {
                    table: self.name().to_string(),
                    operation,
                    rows,
                    elapsed,
                });
            }
        }
        result
    }

    fn operation_completed(&self, event: OperationEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(self, &event);
        }
    }
}

impl<R: Record> Drop for Table<R> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(table = %self.name(), error = %e, "Failed to close table on drop");
        }
    }
}

impl<R: Record> std::fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.core.name)
            .field("descriptor", &self.core.descriptor)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn removed_rows<R: Record>(journal: &[Change<R>]) -> Vec<&dyn PropertySource> {
    let mut rows: Vec<&dyn PropertySource> = Vec::new();
    for change in journal {
        match change {
            Change::Removed(removed) => rows.extend(removed.iter().map(|(_, r)| r as &dyn PropertySource)),
            Change::Cleared(cleared) => rows.extend(cleared.iter().map(|r| r as &dyn PropertySource)),
            _ => {}
        }
    }
    rows
}

fn to_i32(what: &str, value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        StoreError::OutOfRange(format!("{} {} exceeds the file format limit", what, value))
    })
}
