//! Catalog collaborator contract.
//!
//! The persistence engine lives outside this crate; the pipeline only needs the operations
//! on [`Catalog`]. Implementations never retry internally. They classify each failure as
//! retryable or not and the caller applies a [`RetryPolicy`].

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_CATALOG_RETRY_ATTEMPTS, DEFAULT_CATALOG_RETRY_BACKOFF_MS};
use crate::types::{DiskState, FileCatalogEntry};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CatalogError {
    /// The same call may succeed later (connection lost, lock timeout, ...).
    pub retryable: bool,
    pub message: String,
}

impl CatalogError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

pub trait Catalog: Send + Sync {
    /// Highest version cataloged for `file_id` on any disk.
    fn get_max_version(&self, file_id: &str) -> CatalogResult<Option<u32>>;

    /// Insert the row keyed by (file id, version, disk id), replacing any existing one.
    fn insert_or_replace_file(&self, entry: &FileCatalogEntry) -> CatalogResult<()>;

    fn get_disk_state(&self, disk_id: &str) -> CatalogResult<Option<DiskState>>;

    fn set_disk_completed(&self, disk_id: &str, completed: bool) -> CatalogResult<()>;

    /// Persist the accounting view of a disk.
    fn update_disk_state(&self, state: &DiskState) -> CatalogResult<()>;

    /// Rows for one file version, optionally restricted to a disk.
    fn get_file_location(
        &self,
        file_id: &str,
        version: u32,
        disk_id: Option<&str>,
    ) -> CatalogResult<Vec<FileCatalogEntry>>;

    /// Remove one row. Returns whether it existed.
    fn delete_file(&self, file_id: &str, version: u32, disk_id: &str) -> CatalogResult<bool>;

    /// Every row stored on a disk.
    fn list_files(&self, disk_id: &str) -> CatalogResult<Vec<FileCatalogEntry>>;
}

/// Bounded retry with a fixed backoff, owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_CATALOG_RETRY_ATTEMPTS,
            backoff_ms: DEFAULT_CATALOG_RETRY_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 0,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> CatalogResult<T>,
    ) -> CatalogResult<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable && attempt < attempts => {
                    tracing::debug!(
                        target = "archivist::catalog",
                        operation = what,
                        attempt,
                        error = %err,
                        "retrying catalog operation"
                    );
                    attempt += 1;
                    if self.backoff_ms > 0 {
                        thread::sleep(Duration::from_millis(self.backoff_ms));
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "archivist::catalog",
                        operation = what,
                        attempt,
                        retryable = err.retryable,
                        error = %err,
                        "catalog operation failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

type FileKey = (String, u32, String);

/// Process-local catalog, used by tests and single-node deployments without a database.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    files: RwLock<BTreeMap<FileKey, FileCatalogEntry>>,
    disks: RwLock<HashMap<String, DiskState>>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, ordered by file id, version, disk id.
    pub fn all_files(&self) -> CatalogResult<Vec<FileCatalogEntry>> {
        let files = self.files.read().map_err(|_| poisoned())?;
        Ok(files.values().cloned().collect())
    }
}

fn poisoned() -> CatalogError {
    CatalogError::permanent("memory catalog lock poisoned")
}

impl Catalog for MemoryCatalog {
    fn get_max_version(&self, file_id: &str) -> CatalogResult<Option<u32>> {
        let files = self.files.read().map_err(|_| poisoned())?;
        Ok(files
            .keys()
            .filter(|(id, _, _)| id == file_id)
            .map(|(_, version, _)| *version)
            .max())
    }

    fn insert_or_replace_file(&self, entry: &FileCatalogEntry) -> CatalogResult<()> {
        let mut files = self.files.write().map_err(|_| poisoned())?;
        files.insert(
            (entry.file_id.clone(), entry.version, entry.disk_id.clone()),
            entry.clone(),
        );
        Ok(())
    }

    fn get_disk_state(&self, disk_id: &str) -> CatalogResult<Option<DiskState>> {
        let disks = self.disks.read().map_err(|_| poisoned())?;
        Ok(disks.get(disk_id).cloned())
    }

    fn set_disk_completed(&self, disk_id: &str, completed: bool) -> CatalogResult<()> {
        let mut disks = self.disks.write().map_err(|_| poisoned())?;
        match disks.get_mut(disk_id) {
            Some(state) => {
                state.completed = completed;
                Ok(())
            }
            None => Err(CatalogError::permanent(format!("unknown disk {disk_id}"))),
        }
    }

    fn update_disk_state(&self, state: &DiskState) -> CatalogResult<()> {
        let mut disks = self.disks.write().map_err(|_| poisoned())?;
        disks.insert(state.disk_id.clone(), state.clone());
        Ok(())
    }

    fn get_file_location(
        &self,
        file_id: &str,
        version: u32,
        disk_id: Option<&str>,
    ) -> CatalogResult<Vec<FileCatalogEntry>> {
        let files = self.files.read().map_err(|_| poisoned())?;
        Ok(files
            .values()
            .filter(|e| e.file_id == file_id && e.version == version)
            .filter(|e| disk_id.is_none_or(|d| e.disk_id == d))
            .cloned()
            .collect())
    }

    fn delete_file(&self, file_id: &str, version: u32, disk_id: &str) -> CatalogResult<bool> {
        let mut files = self.files.write().map_err(|_| poisoned())?;
        Ok(files
            .remove(&(file_id.to_string(), version, disk_id.to_string()))
            .is_some())
    }

    fn list_files(&self, disk_id: &str) -> CatalogResult<Vec<FileCatalogEntry>> {
        let files = self.files.read().map_err(|_| poisoned())?;
        Ok(files
            .values()
            .filter(|e| e.disk_id == disk_id)
            .cloned()
            .collect())
    }
}
