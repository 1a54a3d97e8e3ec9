//! Disk and storage-set descriptors.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{CONTENT_DIR, STAGING_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskRole {
    Primary,
    Replica,
}

/// Identity of a mounted disk. Immutable for the lifetime of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub disk_id: String,
    pub mount_path: PathBuf,
    pub role: DiskRole,
    pub storage_set_id: String,
    pub slot_id: String,
}

impl Disk {
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.mount_path.join(STAGING_DIR)
    }

    #[must_use]
    pub fn content_dir(&self) -> PathBuf {
        self.mount_path.join(CONTENT_DIR)
    }

    /// Absolute path of a catalog-relative file name on this disk.
    #[must_use]
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.mount_path.join(relative)
    }
}

/// Mutable capacity view of a disk, mirrored into the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskState {
    pub disk_id: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub files: u64,
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once a space-warning notification has been raised for this disk.
    #[serde(default)]
    pub space_warned: bool,
}

impl DiskState {
    #[must_use]
    pub fn new(disk_id: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            disk_id: disk_id.into(),
            total_bytes,
            used_bytes: 0,
            files: 0,
            completed: false,
            completed_at: None,
            space_warned: false,
        }
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// One primary disk plus its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSet {
    pub id: String,
    pub primary: String,
    #[serde(default)]
    pub replicas: Vec<String>,
    /// Replica writes must finish before the request is acknowledged.
    #[serde(default = "default_true")]
    pub synchronize: bool,
    /// Primary and replicas change completion state together.
    #[serde(default)]
    pub mutex: bool,
}

fn default_true() -> bool {
    true
}

impl StorageSet {
    /// Every disk id in the set, primary first.
    pub fn disk_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.replicas.iter().map(String::as_str))
    }

    #[must_use]
    pub fn contains(&self, disk_id: &str) -> bool {
        self.disk_ids().any(|id| id == disk_id)
    }
}
