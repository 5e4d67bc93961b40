//! Table Registry
//!
//! Owned directory of the tables opened against one storage root. Every
//! [`Table`](crate::table::Table) is opened against an `Arc<TableRegistry>`
//! and keeps it alive; the registry in turn holds only weak handles to its
//! tables, the foreign key manager they share, the cache sweeper and the
//! aggregated operation timings.

use crate::cache::{CacheController, Evictable};
use crate::codec::{BlockCipher, RecordCodec};
use crate::config::RegistryConfig;
use crate::error::{Result, StoreError};
use crate::foreign_key::{ForeignKeyManager, TableHandle};
use crate::schema::{CachingStrategy, Compression};
use crate::timing::{format_report, TimingRegistry, TimingReport};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Read-only snapshot of an open table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub path: PathBuf,
    pub record_count: i64,
    /// Uncompressed record block length
    pub data_length: u64,
    /// Record block length on disk
    pub stored_length: u64,
    pub page_count: u64,
    pub caching: CachingStrategy,
    /// Whether the decoded records are resident
    pub loaded: bool,
}

/// Hook for external code interested in table lifecycle
pub trait TableLifecycleObserver: Send + Sync {
    fn table_opened(&self, _table: &TableInfo) {}

    fn table_closed(&self, _name: &str) {}
}

pub struct TableRegistry {
    config: RegistryConfig,
    cipher: Option<Arc<dyn BlockCipher>>,
    foreign_keys: ForeignKeyManager,
    tables: RwLock<HashMap<String, Weak<dyn TableHandle>>>,
    observers: RwLock<Vec<Arc<dyn TableLifecycleObserver>>>,
    timings: TimingRegistry,
    cache: CacheController,
    shut_down: AtomicBool,
}

impl TableRegistry {
    /// Registry over an existing directory, with an optional opaque key
    pub fn new(root: impl AsRef<Path>, encryption_key: Option<&str>) -> Result<Arc<Self>> {
        Self::with_config(
            RegistryConfig::new(root.as_ref())
                .with_encryption_key(encryption_key.map(str::to_string)),
        )
    }

    pub fn with_config(config: RegistryConfig) -> Result<Arc<Self>> {
        Self::build(config, None)
    }

    /// Registry whose record blocks are encrypted with `cipher` under the
    /// configured key
    pub fn with_cipher(config: RegistryConfig, cipher: Arc<dyn BlockCipher>) -> Result<Arc<Self>> {
        if config.encryption_key.is_none() {
            return Err(StoreError::Argument(
                "a cipher requires an encryption key".to_string(),
            ));
        }
        Self::build(config, Some(cipher))
    }

    fn build(config: RegistryConfig, cipher: Option<Arc<dyn BlockCipher>>) -> Result<Arc<Self>> {
        config.validate()?;
        if config.encryption_key.is_some() && cipher.is_none() {
            warn!("Encryption key configured without a cipher; record blocks are stored in the clear");
        }

        let registry = TableRegistry {
            cache: CacheController::new(config.sweep_interval()),
            config,
            cipher,
            foreign_keys: ForeignKeyManager::new(),
            tables: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            timings: TimingRegistry::new(),
            shut_down: AtomicBool::new(false),
        };

        info!(
            root = %registry.config.root.display(),
            min_supported_version = registry.config.min_supported_version,
            encrypted = registry.cipher.is_some(),
            "Created table registry"
        );
        Ok(Arc::new(registry))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn min_supported_version(&self) -> u16 {
        self.config.min_supported_version
    }

    pub fn has_encryption_key(&self) -> bool {
        self.config.encryption_key.is_some()
    }

    /// SHA-256 of the encryption key, hex encoded
    pub fn key_fingerprint(&self) -> Option<String> {
        self.config
            .encryption_key
            .as_ref()
            .map(|key| format!("{:x}", Sha256::digest(key.as_bytes())))
    }

    pub fn foreign_keys(&self) -> &ForeignKeyManager {
        &self.foreign_keys
    }

    /// Snapshots of every open table, sorted by name
    pub fn tables(&self) -> Vec<TableInfo> {
        let handles: Vec<Arc<dyn TableHandle>> = self
            .tables
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        let mut infos: Vec<TableInfo> = handles.iter().filter_map(|h| h.info().ok()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .iter()
            .filter(|(_, handle)| handle.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables
            .read()
            .get(name)
            .map(|t| t.strong_count() > 0)
            .unwrap_or(false)
    }

    pub fn add_observer(&self, observer: Arc<dyn TableLifecycleObserver>) {
        self.observers.write().push(observer);
    }

    pub fn timing_report(&self) -> Vec<TimingReport> {
        self.timings.report()
    }

    pub fn format_timing_report(&self) -> String {
        format_report(&self.timings.report())
    }

    pub fn reset_timings(&self) {
        self.timings.reset();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the cache sweeper and refuse further opens. Open tables keep
    /// working, but sliding tables are no longer swept.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.shutdown();
        info!(root = %self.config.root.display(), "Shut down table registry");
    }

    pub(crate) fn timings(&self) -> &TimingRegistry {
        &self.timings
    }

    pub(crate) fn codec_for(&self, compression: Compression) -> RecordCodec {
        let codec = RecordCodec::new(compression);
        match (&self.cipher, &self.config.encryption_key) {
            (Some(cipher), Some(key)) => codec.with_cipher(Arc::clone(cipher), key.clone()),
            _ => codec,
        }
    }

    /// Fail fast when a table cannot be opened under this name
    pub(crate) fn check_available(&self, name: &str) -> Result<()> {
        if self.is_shut_down() {
            return Err(StoreError::Disposed(name.to_string()));
        }
        if self.contains_table(name) {
            return Err(StoreError::Argument(format!(
                "table '{}' is already open",
                name
            )));
        }
        Ok(())
    }

    pub(crate) fn register_table(
        &self,
        handle: &Arc<dyn TableHandle>,
        evictable: Option<&Arc<dyn Evictable>>,
    ) -> Result<()> {
        let name = handle.table_name().to_string();
        self.check_available(&name)?;

        {
            let mut tables = self.tables.write();
            if tables.get(&name).map(|t| t.strong_count() > 0).unwrap_or(false) {
                return Err(StoreError::Argument(format!(
                    "table '{}' is already open",
                    name
                )));
            }
            tables.insert(name.clone(), Arc::downgrade(handle));
        }

        let watched = self
            .foreign_keys
            .register_table(handle)
            .and_then(|_| match evictable {
                Some(table) => self.cache.watch(table),
                None => Ok(()),
            });
        if let Err(e) = watched {
            self.tables.write().remove(&name);
            let _ = self.foreign_keys.unregister_table(&name);
            return Err(e);
        }

        debug!(table = %name, "Registered table");
        Ok(())
    }

    pub(crate) fn table_opened(&self, info: &TableInfo) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.table_opened(info);
        }
    }

    pub(crate) fn unregister_table(&self, name: &str) {
        self.tables.write().remove(name);
        let _ = self.foreign_keys.unregister_table(name);
        self.cache.unwatch(name);

        let observers = self.observers.read().clone();
        for observer in observers {
            observer.table_closed(name);
        }
        debug!(table = %name, "Unregistered table");
    }
}

impl Drop for TableRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRegistry")
            .field("root", &self.config.root)
            .field("tables", &self.table_names())
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        let err = TableRegistry::new(temp_dir.path().join("missing"), None).unwrap_err();
        assert!(err.is_argument());
    }

    #[test]
    fn test_key_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let registry = TableRegistry::new(temp_dir.path(), Some("secret")).unwrap();
        let fingerprint = registry.key_fingerprint().unwrap();

        assert_eq!(fingerprint.len(), 64);
        assert!(!fingerprint.contains("secret"));
        assert!(registry.has_encryption_key());

        let plain = TableRegistry::new(temp_dir.path(), None).unwrap();
        assert_eq!(plain.key_fingerprint(), None);
    }

    #[test]
    fn test_cipher_requires_key() {
        struct Identity;
        impl BlockCipher for Identity {
            fn encrypt(&self, _key: &str, plain: &[u8]) -> Result<Vec<u8>> {
                Ok(plain.to_vec())
            }
            fn decrypt(&self, _key: &str, sealed: &[u8]) -> Result<Vec<u8>> {
                Ok(sealed.to_vec())
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let result = TableRegistry::with_cipher(RegistryConfig::new(temp_dir.path()), Arc::new(Identity));
        assert!(result.unwrap_err().is_argument());

        let config = RegistryConfig::new(temp_dir.path()).with_encryption_key(Some("k".to_string()));
        let registry = TableRegistry::with_cipher(config, Arc::new(Identity)).unwrap();
        assert!(registry.codec_for(Compression::None).is_encrypted());
    }

    #[test]
    fn test_shutdown_refuses_opens() {
        let temp_dir = TempDir::new().unwrap();
        let registry = TableRegistry::new(temp_dir.path(), None).unwrap();
        registry.check_available("Users").unwrap();

        registry.shutdown();
        registry.shutdown();
        assert!(registry.check_available("Users").unwrap_err().is_disposed());
    }
}
