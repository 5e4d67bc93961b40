//! Error types for the Flatstore engine
//!
//! Every failure is detected synchronously inside the offending call and
//! returned to the caller. Nothing is retried internally.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by tables, the registry and the foreign key manager
#[derive(Error, Debug)]
pub enum StoreError {
    /// Missing or invalid required parameter
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Unreadable table file or header signature mismatch
    #[error("Table file {path} is corrupt: {reason}")]
    Corruption { path: PathBuf, reason: String },

    /// Reference to a missing target row, or removal of a referenced row
    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    /// Duplicate key on a unique index
    #[error("UNIQUE constraint '{index}' violated on table '{table}': key {key} already exists")]
    UniqueViolation {
        table: String,
        index: String,
        key: String,
    },

    /// Attempt to change state that must never change (e.g. a persisted row id)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Operation invoked on a closed table
    #[error("Table '{0}' has been closed")]
    Disposed(String),

    /// Invalid configuration value
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// Table file older than the registry accepts
    #[error("Table file version {found} is older than the minimum supported version {minimum}")]
    UnsupportedVersion { found: u16, minimum: u16 },

    /// Table file is held open by another handle
    #[error("Table file {0} is locked by another handle")]
    Locked(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

impl StoreError {
    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_argument(&self) -> bool {
        matches!(self, StoreError::Argument(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption { .. })
    }

    pub fn is_referential(&self) -> bool {
        matches!(self, StoreError::ReferentialIntegrity(_))
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self, StoreError::InvariantViolation(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, StoreError::Disposed(_))
    }

    pub fn is_out_of_range(&self) -> bool {
        matches!(self, StoreError::OutOfRange(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
