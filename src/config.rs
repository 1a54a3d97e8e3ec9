//! Server configuration.
//!
//! Loaded from JSON with `serde_json`. Every section has defaults, so a minimal document only
//! names the host, the disks and the storage sets. [`ArchiveConfig::validate`] rejects layouts
//! the registry cannot serve.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::RetryPolicy;
use crate::checksum::ChecksumVariant;
use crate::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_DISK_CHANGE_MB, DEFAULT_FORWARD_TIMEOUT_MS,
    DEFAULT_FREE_SPACE_FLOOR_MB, DEFAULT_PULL_TIMEOUT_MS, DEFAULT_SPACE_WARNING_MB,
    DEFAULT_UNIT_STATUS_TTL_MS, MEGABYTE,
};
use crate::error::{ArchiveError, Result};
use crate::types::{ArchivingUnit, DiskRole, StorageSet};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub disk_id: String,
    pub mount_path: PathBuf,
    pub role: DiskRole,
    #[serde(default)]
    pub slot_id: Option<String>,
    /// Explicit capacity; probed from the file system when absent.
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
}

/// Routing for one mime-type: local storage sets in priority order and remote units in
/// fallback order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub mime_type: String,
    #[serde(default)]
    pub storage_sets: Vec<String>,
    #[serde(default)]
    pub units: Vec<ArchivingUnit>,
}

/// Free-space thresholds, in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityThresholds {
    /// Minimum free space for a disk to be selected at all.
    pub free_space_floor_mb: u64,
    /// At or below this, a disk is marked completed.
    pub disk_change_mb: u64,
    /// At or below this (and above `disk_change_mb`), a space warning is raised once.
    pub space_warning_mb: u64,
}

impl Default for CapacityThresholds {
    fn default() -> Self {
        Self {
            free_space_floor_mb: DEFAULT_FREE_SPACE_FLOOR_MB,
            disk_change_mb: DEFAULT_DISK_CHANGE_MB,
            space_warning_mb: DEFAULT_SPACE_WARNING_MB,
        }
    }
}

impl CapacityThresholds {
    #[must_use]
    pub fn free_space_floor_bytes(&self) -> u64 {
        self.free_space_floor_mb.saturating_mul(MEGABYTE)
    }

    #[must_use]
    pub fn disk_change_bytes(&self) -> u64 {
        self.disk_change_mb.saturating_mul(MEGABYTE)
    }

    #[must_use]
    pub fn space_warning_bytes(&self) -> u64 {
        self.space_warning_mb.saturating_mul(MEGABYTE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Forward through the unit list even when local storage exists.
    pub multiplex: bool,
    pub forward_timeout_ms: u64,
    /// How long an `Offline`/`NoFreeStorage` mark demotes a unit.
    pub unit_status_ttl_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            multiplex: false,
            forward_timeout_ms: DEFAULT_FORWARD_TIMEOUT_MS,
            unit_status_ttl_ms: DEFAULT_UNIT_STATUS_TTL_MS,
        }
    }
}

impl ProxyConfig {
    #[must_use]
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    #[must_use]
    pub fn unit_status_ttl(&self) -> Duration {
        Duration::from_millis(self.unit_status_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// `host:port` of this server, recorded as the owner of cataloged files.
    pub host_id: String,
    pub back_log_area: PathBuf,
    pub bad_files_area: PathBuf,
    #[serde(default = "default_true")]
    pub back_log_buffering: bool,
    pub disks: Vec<DiskConfig>,
    pub storage_sets: Vec<StorageSet>,
    pub streams: Vec<StreamConfig>,
    pub thresholds: CapacityThresholds,
    /// Checksum variant used when a request does not override it.
    pub checksum: ChecksumVariant,
    pub block_size: usize,
    /// Per-request upper bound on the staged size.
    pub max_file_size: Option<u64>,
    pub catalog_retry: RetryPolicy,
    pub proxy: ProxyConfig,
    pub pull_timeout_ms: u64,
    /// File-name extension (without the leading dot) to mime-type.
    pub mime_types: BTreeMap<String, String>,
    pub allow_remove_requests: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        let mime_types = [
            ("fits", "image/x-fits"),
            ("fits.gz", "application/x-gfits"),
            ("fits.z", "application/x-cfits"),
            ("txt", "text/plain"),
            ("log", "text/plain"),
            ("tar", "application/x-tar"),
            ("bin", "application/octet-stream"),
        ]
        .into_iter()
        .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
        .collect();
        Self {
            host_id: "localhost:7777".to_string(),
            back_log_area: PathBuf::from("back-log"),
            bad_files_area: PathBuf::from("bad-files"),
            back_log_buffering: true,
            disks: Vec::new(),
            storage_sets: Vec::new(),
            streams: Vec::new(),
            thresholds: CapacityThresholds::default(),
            checksum: ChecksumVariant::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_file_size: None,
            catalog_retry: RetryPolicy::default(),
            proxy: ProxyConfig::default(),
            pull_timeout_ms: DEFAULT_PULL_TIMEOUT_MS,
            mime_types,
            allow_remove_requests: false,
        }
    }
}

impl ArchiveConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs_err::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        tracing::info!(
            target = "archivist::config",
            path = %path.display(),
            disks = config.disks.len(),
            storage_sets = config.storage_sets.len(),
            streams = config.streams.len(),
            "loaded archive configuration"
        );
        Ok(config)
    }

    #[must_use]
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    #[must_use]
    pub fn disk(&self, disk_id: &str) -> Option<&DiskConfig> {
        self.disks.iter().find(|d| d.disk_id == disk_id)
    }

    #[must_use]
    pub fn storage_set(&self, set_id: &str) -> Option<&StorageSet> {
        self.storage_sets.iter().find(|s| s.id == set_id)
    }

    #[must_use]
    pub fn stream(&self, mime_type: &str) -> Option<&StreamConfig> {
        self.streams
            .iter()
            .find(|s| s.mime_type.eq_ignore_ascii_case(mime_type))
    }

    /// Mime-type for a file name, by its longest configured extension.
    #[must_use]
    pub fn mime_type_for(&self, filename: &str) -> Option<&str> {
        let lower = filename.to_ascii_lowercase();
        self.mime_types
            .iter()
            .filter(|(ext, _)| lower.ends_with(&format!(".{}", ext.to_ascii_lowercase())))
            .max_by_key(|(ext, _)| ext.len())
            .map(|(_, mime)| mime.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_id.trim().is_empty() {
            return Err(ArchiveError::Config("host_id must not be empty".into()));
        }
        if self.block_size == 0 {
            return Err(ArchiveError::Config("block_size must be positive".into()));
        }
        let t = &self.thresholds;
        if t.space_warning_mb < t.disk_change_mb {
            return Err(ArchiveError::Config(format!(
                "space_warning_mb ({}) must not be below disk_change_mb ({})",
                t.space_warning_mb, t.disk_change_mb
            )));
        }

        let mut disk_ids = HashSet::new();
        for disk in &self.disks {
            if !disk_ids.insert(disk.disk_id.as_str()) {
                return Err(ArchiveError::Config(format!(
                    "duplicate disk id {}",
                    disk.disk_id
                )));
            }
        }

        let mut set_ids = HashSet::new();
        let mut assigned = HashSet::new();
        for set in &self.storage_sets {
            if !set_ids.insert(set.id.as_str()) {
                return Err(ArchiveError::Config(format!(
                    "duplicate storage set id {}",
                    set.id
                )));
            }
            for (index, disk_id) in set.disk_ids().enumerate() {
                let expected = if index == 0 {
                    DiskRole::Primary
                } else {
                    DiskRole::Replica
                };
                let disk = self.disk(disk_id).ok_or_else(|| {
                    ArchiveError::Config(format!(
                        "storage set {} references unknown disk {disk_id}",
                        set.id
                    ))
                })?;
                if disk.role != expected {
                    return Err(ArchiveError::Config(format!(
                        "disk {disk_id} has role {:?} but storage set {} uses it as {expected:?}",
                        disk.role, set.id
                    )));
                }
                if !assigned.insert(disk_id) {
                    return Err(ArchiveError::Config(format!(
                        "disk {disk_id} belongs to more than one storage set"
                    )));
                }
            }
        }

        let mut mime_types = HashSet::new();
        for stream in &self.streams {
            if !mime_types.insert(stream.mime_type.to_ascii_lowercase()) {
                return Err(ArchiveError::Config(format!(
                    "duplicate stream for mime-type {}",
                    stream.mime_type
                )));
            }
            if let Some(unknown) = stream
                .storage_sets
                .iter()
                .find(|id| !set_ids.contains(id.as_str()))
            {
                return Err(ArchiveError::Config(format!(
                    "stream {} references unknown storage set {unknown}",
                    stream.mime_type
                )));
            }
        }
        Ok(())
    }
}
