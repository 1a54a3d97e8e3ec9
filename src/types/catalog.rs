//! Catalog rows.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::{Checksum, ChecksumVariant};

/// One stored copy of one file version on one disk.
///
/// A row exists exactly when its bytes are present at `mount_path/filename` on the disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCatalogEntry {
    pub file_id: String,
    pub version: u32,
    pub disk_id: String,
    /// Path relative to the disk's mount point.
    pub filename: PathBuf,
    pub size: u64,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub checksum_plugin: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub mime_type: String,
    pub host_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FileCatalogEntry {
    /// Stored checksum, when the row has one with a known variant.
    #[must_use]
    pub fn stored_checksum(&self) -> Option<Checksum> {
        let variant = ChecksumVariant::from_plugin_id(self.checksum_plugin.as_deref()?)?;
        Some(Checksum {
            variant,
            value: self.checksum.clone()?,
        })
    }

    /// Whether two rows describe the same archived bytes (same size and digest).
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.size == other.size
            && self.checksum == other.checksum
            && self.checksum_plugin == other.checksum_plugin
    }
}
