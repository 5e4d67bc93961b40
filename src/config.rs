//! Registry configuration

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: i32 = 4096;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_FILE_EXTENSION: &str = "fst";

/// Settings for a [`TableRegistry`](crate::registry::TableRegistry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding the table files; must already exist
    pub root: PathBuf,
    /// Opaque key handed to the block cipher
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
    /// Files with an older table version are refused
    pub min_supported_version: u16,
    pub default_page_size: i32,
    pub sweep_interval_ms: u64,
    pub file_extension: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            root: PathBuf::from("."),
            encryption_key: None,
            min_supported_version: 1,
            default_page_size: DEFAULT_PAGE_SIZE,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RegistryConfig {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| StoreError::Argument(format!("invalid registry configuration: {}", e)))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_encryption_key(mut self, key: Option<String>) -> Self {
        self.encryption_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_min_supported_version(mut self, version: u16) -> Self {
        self.min_supported_version = version;
        self
    }

    pub fn with_default_page_size(mut self, page_size: i32) -> Self {
        self.default_page_size = page_size;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_file_extension(mut self, extension: &str) -> Self {
        self.file_extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// File holding the named table
    pub fn table_path(&self, table: &str) -> PathBuf {
        if self.file_extension.is_empty() {
            self.root.join(table)
        } else {
            self.root.join(format!("{}.{}", table, self.file_extension))
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(StoreError::Argument("root path is required".to_string()));
        }
        if !self.root.is_dir() {
            return Err(StoreError::Argument(format!(
                "root path {} does not exist",
                self.root.display()
            )));
        }
        if self.default_page_size <= 0 {
            return Err(StoreError::OutOfRange(format!(
                "page size must be positive, got {}",
                self.default_page_size
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(StoreError::OutOfRange(
                "sweep interval must be at least 1 ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_and_builders() {
        let temp_dir = TempDir::new().unwrap();
        let config = RegistryConfig::new(temp_dir.path())
            .with_encryption_key(Some("secret".to_string()))
            .with_default_page_size(512)
            .with_file_extension(".tbl");

        assert!(config.validate().is_ok());
        assert_eq!(config.default_page_size, 512);
        assert_eq!(config.table_path("Users"), temp_dir.path().join("Users.tbl"));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_key_is_no_key() {
        let config = RegistryConfig::default().with_encryption_key(Some(String::new()));
        assert_eq!(config.encryption_key, None);
    }

    #[test]
    fn test_missing_root_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = RegistryConfig::new(temp_dir.path().join("nope"));
        assert!(config.validate().unwrap_err().is_argument());
    }

    #[test]
    fn test_out_of_range_values() {
        let temp_dir = TempDir::new().unwrap();
        let config = RegistryConfig::new(temp_dir.path()).with_default_page_size(0);
        assert!(config.validate().unwrap_err().is_out_of_range());

        let config = RegistryConfig::new(temp_dir.path()).with_sweep_interval(Duration::ZERO);
        assert!(config.validate().unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_from_json() {
        let config = RegistryConfig::from_json_str(
            r#"{ "root": "/var/lib/flatstore", "min_supported_version": 2, "sweep_interval_ms": 250 }"#,
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/var/lib/flatstore"));
        assert_eq!(config.min_supported_version, 2);
        assert_eq!(config.default_page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.file_extension, "fst");

        assert!(RegistryConfig::from_json_str("{ not json").unwrap_err().is_argument());
    }
}
