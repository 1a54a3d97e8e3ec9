//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use archivist_core::{
    ArchiveConfig, ArchiveError, ArchiveOutcome, ArchiveRequest, Archiver, ArchiverBuilder,
    ArchivingUnit, CapacityThresholds, Catalog, CatalogError, CatalogResult, DiskConfig, DiskRole,
    DiskState, FileCatalogEntry, ForwardBody, ForwardError, MemoryCatalog, Notification,
    Notifier, NotifyError, RetryPolicy, StorageSet, StreamConfig, UnitTransport,
};
use tempfile::TempDir;

pub const FITS: &str = "image/x-fits";
pub const MB: u64 = 1024 * 1024;

/// Temporary archive layout: every disk is a directory under one temp root.
pub struct Fixture {
    pub root: TempDir,
    pub config: ArchiveConfig,
}

pub struct SetSpec<'a> {
    pub id: &'a str,
    pub primary: &'a str,
    pub replicas: &'a [&'a str],
    pub synchronize: bool,
    pub mutex: bool,
}

impl<'a> SetSpec<'a> {
    pub fn sync(id: &'a str, primary: &'a str, replicas: &'a [&'a str]) -> Self {
        Self {
            id,
            primary,
            replicas,
            synchronize: true,
            mutex: false,
        }
    }

    pub fn asynchronous(mut self) -> Self {
        self.synchronize = false;
        self
    }

    pub fn mutex(mut self) -> Self {
        self.mutex = true;
        self
    }
}

impl Fixture {
    /// One synchronous set `set1` (`p1` + `r1`) serving FITS and plain text.
    pub fn single_set() -> Self {
        Self::with_sets(&[SetSpec::sync("set1", "p1", &["r1"])], 100 * MB)
    }

    pub fn with_sets(sets: &[SetSpec<'_>], capacity_bytes: u64) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut disks = Vec::new();
        let mut storage_sets = Vec::new();
        for spec in sets {
            disks.push(disk(&root, spec.primary, DiskRole::Primary, capacity_bytes));
            for replica in spec.replicas {
                disks.push(disk(&root, replica, DiskRole::Replica, capacity_bytes));
            }
            storage_sets.push(StorageSet {
                id: spec.id.to_string(),
                primary: spec.primary.to_string(),
                replicas: spec.replicas.iter().map(|r| (*r).to_string()).collect(),
                synchronize: spec.synchronize,
                mutex: spec.mutex,
            });
        }
        let set_ids: Vec<String> = storage_sets.iter().map(|s| s.id.clone()).collect();
        let config = ArchiveConfig {
            host_id: "arch1:7777".into(),
            back_log_area: root.path().join("back-log"),
            bad_files_area: root.path().join("bad-files"),
            disks,
            storage_sets,
            streams: [FITS, "text/plain"]
                .into_iter()
                .map(|mime| StreamConfig {
                    mime_type: mime.into(),
                    storage_sets: set_ids.clone(),
                    units: Vec::new(),
                })
                .collect(),
            thresholds: CapacityThresholds {
                free_space_floor_mb: 0,
                disk_change_mb: 1,
                space_warning_mb: 2,
            },
            catalog_retry: RetryPolicy::none(),
            ..ArchiveConfig::default()
        };
        Self { root, config }
    }

    pub fn mount(&self, disk_id: &str) -> PathBuf {
        self.root.path().join("disks").join(disk_id)
    }

    pub fn builder(&self) -> ArchiverBuilder {
        Archiver::builder(self.config.clone())
    }

    pub fn open(&self) -> Archiver {
        self.builder().open().unwrap()
    }

    pub fn staging_entries(&self, disk_id: &str) -> Vec<PathBuf> {
        list(&self.mount(disk_id).join("staging"))
    }

    pub fn backlog_entries(&self) -> Vec<PathBuf> {
        list(&self.config.back_log_area)
    }

    pub fn bad_file_entries(&self) -> Vec<PathBuf> {
        list(&self.config.bad_files_area)
    }
}

fn disk(root: &TempDir, id: &str, role: DiskRole, capacity_bytes: u64) -> DiskConfig {
    DiskConfig {
        disk_id: id.into(),
        mount_path: root.path().join("disks").join(id),
        role,
        slot_id: None,
        capacity_bytes: Some(capacity_bytes),
    }
}

fn list(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    };
    out.sort();
    out
}

/// A structurally valid FITS file of `blocks` 2880-byte blocks.
pub fn fits_bytes(blocks: usize) -> Vec<u8> {
    let mut bytes = b"SIMPLE  =                    T".to_vec();
    bytes.resize(blocks * 2880, b' ');
    bytes
}

pub fn push(archiver: &Archiver, filename: &str, bytes: &[u8]) -> ArchiveOutcome {
    let request = ArchiveRequest::push(filename).with_content_length(bytes.len() as u64);
    archiver.archive(&request, &mut &bytes[..])
}

/// In-memory catalog whose file inserts can be made to fail.
#[derive(Default)]
pub struct FlakyCatalog {
    pub inner: MemoryCatalog,
    /// Number of upcoming inserts that fail.
    pub failing_inserts: AtomicUsize,
    /// Failures are permanent rather than transient.
    pub permanent: AtomicBool,
}

impl FlakyCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<FileCatalogEntry> {
        self.inner.all_files().unwrap()
    }
}

impl Catalog for FlakyCatalog {
    fn get_max_version(&self, file_id: &str) -> CatalogResult<Option<u32>> {
        self.inner.get_max_version(file_id)
    }

    fn insert_or_replace_file(&self, entry: &FileCatalogEntry) -> CatalogResult<()> {
        let remaining = self.failing_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_inserts.store(remaining - 1, Ordering::SeqCst);
            return Err(if self.permanent.load(Ordering::SeqCst) {
                CatalogError::permanent("constraint violated")
            } else {
                CatalogError::transient("catalog unreachable")
            });
        }
        self.inner.insert_or_replace_file(entry)
    }

    fn get_disk_state(&self, disk_id: &str) -> CatalogResult<Option<DiskState>> {
        self.inner.get_disk_state(disk_id)
    }

    fn set_disk_completed(&self, disk_id: &str, completed: bool) -> CatalogResult<()> {
        self.inner.set_disk_completed(disk_id, completed)
    }

    fn update_disk_state(&self, state: &DiskState) -> CatalogResult<()> {
        self.inner.update_disk_state(state)
    }

    fn get_file_location(
        &self,
        file_id: &str,
        version: u32,
        disk_id: Option<&str>,
    ) -> CatalogResult<Vec<FileCatalogEntry>> {
        self.inner.get_file_location(file_id, version, disk_id)
    }

    fn delete_file(&self, file_id: &str, version: u32, disk_id: &str) -> CatalogResult<bool> {
        self.inner.delete_file(file_id, version, disk_id)
    }

    fn list_files(&self, disk_id: &str) -> CatalogResult<Vec<FileCatalogEntry>> {
        self.inner.list_files(disk_id)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Scripted reply of one remote unit.
#[derive(Clone)]
pub enum UnitReply {
    Offline,
    NoFreeStorage,
    Archive,
}

/// Transport answering per unit port, recording every call.
#[derive(Default)]
pub struct MockTransport {
    pub replies: Mutex<HashMap<u16, UnitReply>>,
    pub calls: Mutex<Vec<(ArchivingUnit, Option<u64>)>>,
}

impl MockTransport {
    pub fn new(replies: &[(u16, UnitReply)]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().cloned().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn called_ports(&self) -> Vec<u16> {
        self.calls.lock().unwrap().iter().map(|(u, _)| u.port).collect()
    }
}

impl UnitTransport for MockTransport {
    fn forward(
        &self,
        unit: &ArchivingUnit,
        request: &ArchiveRequest,
        _mime_type: &str,
        body: ForwardBody<'_>,
        _timeout: Duration,
    ) -> Result<ArchiveOutcome, ForwardError> {
        let body_len = match body {
            ForwardBody::File(path) => Some(std::fs::metadata(path).unwrap().len()),
            ForwardBody::None => None,
        };
        self.calls.lock().unwrap().push((unit.clone(), body_len));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&unit.port)
            .cloned()
            .unwrap_or(UnitReply::Offline);
        match reply {
            UnitReply::Offline => Err(ForwardError::Offline(unit.to_string())),
            UnitReply::NoFreeStorage => Ok(ArchiveOutcome::failure(
                request.request_id,
                &unit.host_id(),
                &ArchiveError::NoFreeStorageSet {
                    mime_type: FITS.into(),
                },
            )),
            UnitReply::Archive => Ok(ArchiveOutcome::success(
                request.request_id,
                &unit.host_id(),
                &request.effective_file_id(),
                1,
                "remote-disk",
                body_len.unwrap_or(0),
                None,
            )),
        }
    }
}
