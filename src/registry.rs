//! Disk and storage-set registry.
//!
//! Holds one capacity slot per configured disk behind its own mutex. Capacity accounting and
//! completion transitions happen under those locks; the byte copies themselves never do.
//! Storage sets flagged `mutex` lock every member disk, in disk-id order, so their completion
//! flags always flip together.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::catalog::{Catalog, RetryPolicy};
use crate::config::{ArchiveConfig, CapacityThresholds};
use crate::constants::MEGABYTE;
use crate::error::{ArchiveError, Result};
use crate::notify::{Notification, NotificationKind, Notifier, dispatch};
use crate::types::{Disk, DiskState, StorageSet};

struct DiskSlot {
    disk: Disk,
    state: Mutex<DiskState>,
}

/// Accounting result of one recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub disk_id: String,
    pub free_bytes: u64,
    /// The write pushed the disk over its disk-change threshold.
    pub completed_disk: bool,
}

pub struct DiskRegistry {
    disks: BTreeMap<String, DiskSlot>,
    sets: Vec<StorageSet>,
    streams: BTreeMap<String, Vec<String>>,
    thresholds: CapacityThresholds,
    catalog: Arc<dyn Catalog>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for DiskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskRegistry")
            .field("disks", &self.disks.keys().collect::<Vec<_>>())
            .field("sets", &self.sets)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl DiskRegistry {
    /// Build the registry from configuration, loading each disk's state from the catalog or
    /// initialising it from the configured or probed capacity.
    pub fn new(
        config: &ArchiveConfig,
        catalog: Arc<dyn Catalog>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let retry = config.catalog_retry;
        let mut disks = BTreeMap::new();
        for set in &config.storage_sets {
            for disk_id in set.disk_ids() {
                let disk_config = config.disk(disk_id).ok_or_else(|| {
                    ArchiveError::Config(format!(
                        "storage set {} references unknown disk {disk_id}",
                        set.id
                    ))
                })?;
                let disk = Disk {
                    disk_id: disk_id.to_string(),
                    mount_path: disk_config.mount_path.clone(),
                    role: disk_config.role,
                    storage_set_id: set.id.clone(),
                    slot_id: disk_config
                        .slot_id
                        .clone()
                        .unwrap_or_else(|| disk_id.to_string()),
                };
                let state = match retry.run("get_disk_state", || catalog.get_disk_state(disk_id))? {
                    Some(state) => state,
                    None => {
                        let state = initial_state(&disk, disk_config.capacity_bytes)?;
                        retry.run("update_disk_state", || catalog.update_disk_state(&state))?;
                        state
                    }
                };
                tracing::debug!(
                    target = "archivist::registry",
                    disk_id,
                    storage_set = %set.id,
                    free_mb = state.free_bytes() / MEGABYTE,
                    completed = state.completed,
                    "registered disk"
                );
                disks.insert(
                    disk_id.to_string(),
                    DiskSlot {
                        disk,
                        state: Mutex::new(state),
                    },
                );
            }
        }
        for disk in &config.disks {
            if !disks.contains_key(&disk.disk_id) {
                tracing::warn!(
                    target = "archivist::registry",
                    disk_id = %disk.disk_id,
                    "disk belongs to no storage set and will not be written"
                );
            }
        }
        let streams = config
            .streams
            .iter()
            .map(|s| (s.mime_type.to_ascii_lowercase(), s.storage_sets.clone()))
            .collect();
        Ok(Self {
            disks,
            sets: config.storage_sets.clone(),
            streams,
            thresholds: config.thresholds,
            catalog,
            notifier,
            retry,
        })
    }

    /// False on proxy-only nodes (no storage sets configured).
    #[must_use]
    pub fn is_eligible_locally(&self) -> bool {
        !self.sets.is_empty()
    }

    /// Whether the mime-type is routed to at least one local storage set.
    #[must_use]
    pub fn has_local_route(&self, mime_type: &str) -> bool {
        self.streams
            .get(&mime_type.to_ascii_lowercase())
            .is_some_and(|sets| !sets.is_empty())
    }

    #[must_use]
    pub fn disk(&self, disk_id: &str) -> Option<&Disk> {
        self.disks.get(disk_id).map(|slot| &slot.disk)
    }

    pub fn disks(&self) -> impl Iterator<Item = &Disk> {
        self.disks.values().map(|slot| &slot.disk)
    }

    #[must_use]
    pub fn storage_sets(&self) -> &[StorageSet] {
        &self.sets
    }

    #[must_use]
    pub fn storage_set(&self, set_id: &str) -> Option<&StorageSet> {
        self.sets.iter().find(|s| s.id == set_id)
    }

    #[must_use]
    pub fn set_for_disk(&self, disk_id: &str) -> Option<&StorageSet> {
        let disk = self.disk(disk_id)?;
        self.storage_set(&disk.storage_set_id)
    }

    pub fn disk_state(&self, disk_id: &str) -> Result<DiskState> {
        Ok(self.lock(disk_id)?.clone())
    }

    /// First storage set, in the stream's priority order, whose disks are all open and above
    /// the free-space floor.
    pub fn select_target_set(&self, mime_type: &str) -> Result<StorageSet> {
        let set_ids = self
            .streams
            .get(&mime_type.to_ascii_lowercase())
            .ok_or_else(|| ArchiveError::UnknownMimeType {
                mime_type: mime_type.to_string(),
            })?;
        let floor = self.thresholds.free_space_floor_bytes();
        for set_id in set_ids {
            let Some(set) = self.storage_set(set_id) else {
                continue;
            };
            let mut usable = true;
            for disk_id in set.disk_ids() {
                let state = self.lock(disk_id)?;
                if state.completed || state.free_bytes() <= floor {
                    usable = false;
                    break;
                }
            }
            if usable {
                tracing::debug!(
                    target = "archivist::registry",
                    mime_type,
                    storage_set = %set.id,
                    "selected storage set"
                );
                return Ok(set.clone());
            }
        }
        Err(ArchiveError::NoFreeStorageSet {
            mime_type: mime_type.to_string(),
        })
    }

    /// Account `bytes` against one disk and apply the capacity thresholds atomically with it.
    ///
    /// Fails with [`ArchiveError::DiskCompleted`] once the disk is completed.
    pub fn record_write(&self, disk_id: &str, bytes: u64) -> Result<WriteRecord> {
        let set = self.set_for_disk(disk_id).ok_or_else(|| {
            ArchiveError::Config(format!("disk {disk_id} is not part of any storage set"))
        })?;
        self.account(set, &[disk_id], bytes)?
            .pop()
            .ok_or_else(|| ArchiveError::Config(format!("unknown disk {disk_id}")))
    }

    /// Account one copy of `bytes` on every disk of `set` in a single step.
    ///
    /// Completion is evaluated once all members are booked, so the file that completes a set
    /// has its replicas paid for. Fails with [`ArchiveError::DiskCompleted`] if any member is
    /// already completed; nothing is accounted then.
    pub fn reserve_set(&self, set: &StorageSet, bytes: u64) -> Result<Vec<WriteRecord>> {
        let disk_ids: Vec<&str> = set.disk_ids().collect();
        self.account(set, &disk_ids, bytes)
    }

    fn account(&self, set: &StorageSet, targets: &[&str], bytes: u64) -> Result<Vec<WriteRecord>> {
        // BTreeMap keys are already ordered; filtering keeps that order.
        let lock_ids: Vec<&str> = self
            .disks
            .keys()
            .map(String::as_str)
            .filter(|id| {
                if set.mutex {
                    set.contains(id)
                } else {
                    targets.contains(id)
                }
            })
            .collect();
        let mut guards: BTreeMap<&str, MutexGuard<'_, DiskState>> = BTreeMap::new();
        for id in lock_ids {
            guards.insert(id, self.lock(id)?);
        }
        for disk_id in targets {
            let state = guards
                .get(disk_id)
                .ok_or_else(|| ArchiveError::Config(format!("unknown disk {disk_id}")))?;
            if state.completed {
                return Err(ArchiveError::DiskCompleted {
                    disk_id: (*disk_id).to_string(),
                });
            }
        }

        let mut notifications = Vec::new();
        let mut records = Vec::with_capacity(targets.len());
        for disk_id in targets {
            let Some(state) = guards.get_mut(disk_id) else {
                continue;
            };
            state.used_bytes = state.used_bytes.saturating_add(bytes);
            state.files += 1;
            let free = state.free_bytes();
            let crossed = free <= self.thresholds.disk_change_bytes();
            if !crossed && free <= self.thresholds.space_warning_bytes() && !state.space_warned {
                state.space_warned = true;
                notifications.push(
                    Notification::new(NotificationKind::SpaceWarning, *disk_id)
                        .with_detail("free_mb", free / MEGABYTE)
                        .with_detail("threshold_mb", self.thresholds.space_warning_mb),
                );
            }
            records.push(WriteRecord {
                disk_id: (*disk_id).to_string(),
                free_bytes: free,
                completed_disk: crossed,
            });
        }

        let now = Utc::now();
        for record in records.iter().filter(|r| r.completed_disk) {
            let mut flipped = Vec::new();
            for (id, state) in &mut guards {
                if (*id == record.disk_id.as_str() || set.mutex) && !state.completed {
                    state.completed = true;
                    state.completed_at = Some(now);
                    flipped.push((*id).to_string());
                }
            }
            if flipped.is_empty() {
                continue;
            }
            tracing::info!(
                target = "archivist::registry",
                disk_id = %record.disk_id,
                storage_set = %set.id,
                completed = ?flipped,
                free_mb = record.free_bytes / MEGABYTE,
                "disk change threshold reached"
            );
            notifications.push(
                Notification::new(NotificationKind::DiskChange, &record.disk_id)
                    .with_detail("storage_set", &set.id)
                    .with_detail("completed_disks", flipped.join(","))
                    .with_detail("free_mb", record.free_bytes / MEGABYTE),
            );
        }

        let snapshots: Vec<DiskState> = guards.values().map(|s| (**s).clone()).collect();
        drop(guards);

        for state in &snapshots {
            if let Err(err) = self
                .retry
                .run("update_disk_state", || self.catalog.update_disk_state(state))
            {
                tracing::warn!(
                    target = "archivist::registry",
                    disk_id = %state.disk_id,
                    error = %err,
                    "failed to persist disk state"
                );
            }
        }
        for notification in &notifications {
            dispatch(self.notifier.as_ref(), notification);
        }
        Ok(records)
    }

    /// Undo the accounting of a write whose bytes were removed again.
    pub fn release_write(&self, disk_id: &str, bytes: u64) -> Result<()> {
        let snapshot = {
            let mut state = self.lock(disk_id)?;
            state.used_bytes = state.used_bytes.saturating_sub(bytes);
            state.files = state.files.saturating_sub(1);
            state.clone()
        };
        self.retry
            .run("update_disk_state", || self.catalog.update_disk_state(&snapshot))?;
        Ok(())
    }

    /// Operator override of the completion flag, applied to every member of a mutex set.
    pub fn set_completed(&self, disk_id: &str, completed: bool) -> Result<()> {
        let set = self
            .set_for_disk(disk_id)
            .ok_or_else(|| ArchiveError::Config(format!("unknown disk {disk_id}")))?;
        let targets: Vec<&str> = if set.mutex {
            self.disks
                .keys()
                .map(String::as_str)
                .filter(|id| set.contains(id))
                .collect()
        } else {
            vec![disk_id]
        };
        let mut guards = Vec::with_capacity(targets.len());
        for id in &targets {
            guards.push(self.lock(id)?);
        }
        for state in &mut guards {
            state.completed = completed;
            state.completed_at = completed.then(Utc::now);
            if !completed {
                state.space_warned = false;
            }
        }
        drop(guards);
        for id in targets {
            self.retry
                .run("set_disk_completed", || self.catalog.set_disk_completed(id, completed))?;
        }
        Ok(())
    }

    fn lock(&self, disk_id: &str) -> Result<MutexGuard<'_, DiskState>> {
        let slot = self
            .disks
            .get(disk_id)
            .ok_or_else(|| ArchiveError::Config(format!("unknown disk {disk_id}")))?;
        slot.state
            .lock()
            .map_err(|err| ArchiveError::poisoned("disk state", err))
    }
}

fn initial_state(disk: &Disk, capacity: Option<u64>) -> Result<DiskState> {
    if let Some(total) = capacity {
        return Ok(DiskState::new(&disk.disk_id, total));
    }
    let total = fs2::total_space(&disk.mount_path)?;
    let available = fs2::available_space(&disk.mount_path)?;
    let mut state = DiskState::new(&disk.disk_id, total);
    state.used_bytes = total.saturating_sub(available);
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::{DiskConfig, StreamConfig};
    use crate::types::DiskRole;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        disk_change: AtomicUsize,
        space_warning: AtomicUsize,
    }

    impl Notifier for Counting {
        fn notify(&self, n: &Notification) -> std::result::Result<(), crate::notify::NotifyError> {
            match n.kind {
                NotificationKind::DiskChange => self.disk_change.fetch_add(1, Ordering::SeqCst),
                NotificationKind::SpaceWarning => {
                    self.space_warning.fetch_add(1, Ordering::SeqCst)
                }
                NotificationKind::ReplicationFailure => 0,
            };
            Ok(())
        }
    }

    fn config(mutex: bool, capacity_mb: u64) -> ArchiveConfig {
        let disk = |id: &str, role| DiskConfig {
            disk_id: id.into(),
            mount_path: format!("/nonexistent/{id}").into(),
            role,
            slot_id: None,
            capacity_bytes: Some(capacity_mb * MEGABYTE),
        };
        ArchiveConfig {
            disks: vec![disk("p1", DiskRole::Primary), disk("r1", DiskRole::Replica)],
            storage_sets: vec![StorageSet {
                id: "set1".into(),
                primary: "p1".into(),
                replicas: vec!["r1".into()],
                synchronize: true,
                mutex,
            }],
            streams: vec![StreamConfig {
                mime_type: "image/x-fits".into(),
                storage_sets: vec!["set1".into()],
                units: Vec::new(),
            }],
            thresholds: CapacityThresholds {
                free_space_floor_mb: 1,
                disk_change_mb: 10,
                space_warning_mb: 20,
            },
            ..ArchiveConfig::default()
        }
    }

    fn build_registry(mutex: bool, capacity_mb: u64) -> (DiskRegistry, Arc<Counting>) {
        let notifier = Arc::new(Counting::default());
        let registry = DiskRegistry::new(
            &config(mutex, capacity_mb),
            Arc::new(MemoryCatalog::new()),
            notifier.clone(),
        )
        .unwrap();
        (registry, notifier)
    }

    #[test]
    fn completed_disk_rejects_further_writes() {
        let (registry, notifier) = build_registry(false, 30);
        let first = registry.record_write("p1", 25 * MEGABYTE).unwrap();
        assert!(first.completed_disk);
        assert!(registry.disk_state("p1").unwrap().completed);
        assert!(matches!(
            registry.record_write("p1", 1),
            Err(ArchiveError::DiskCompleted { .. })
        ));
        assert_eq!(notifier.disk_change.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry.select_target_set("image/x-fits"),
            Err(ArchiveError::NoFreeStorageSet { .. })
        ));
    }

    #[test]
    fn mutex_set_completes_together() {
        let (registry, notifier) = build_registry(true, 30);
        registry.record_write("p1", 25 * MEGABYTE).unwrap();
        assert!(registry.disk_state("r1").unwrap().completed);
        assert!(matches!(
            registry.record_write("r1", 1),
            Err(ArchiveError::DiskCompleted { .. })
        ));
        assert_eq!(registry.disk_state("r1").unwrap().used_bytes, 0);
        assert_eq!(notifier.disk_change.load(Ordering::SeqCst), 1);

        let (registry, _) = build_registry(false, 30);
        registry.record_write("p1", 25 * MEGABYTE).unwrap();
        assert!(!registry.disk_state("r1").unwrap().completed);
    }

    #[test]
    fn set_reservation_books_every_member_before_completion() {
        let (registry, notifier) = build_registry(true, 30);
        let set = registry.storage_set("set1").unwrap().clone();
        let records = registry.reserve_set(&set, 25 * MEGABYTE).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.completed_disk));
        for disk_id in ["p1", "r1"] {
            let state = registry.disk_state(disk_id).unwrap();
            assert!(state.completed);
            assert_eq!(state.used_bytes, 25 * MEGABYTE);
            assert_eq!(state.files, 1);
        }
        assert_eq!(notifier.disk_change.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry.reserve_set(&set, 1),
            Err(ArchiveError::DiskCompleted { .. })
        ));
    }

    #[test]
    fn completed_replica_rejects_writes() {
        let (registry, notifier) = build_registry(false, 30);
        let set = registry.storage_set("set1").unwrap().clone();
        registry.record_write("r1", 25 * MEGABYTE).unwrap();
        assert!(registry.disk_state("r1").unwrap().completed);
        assert!(!registry.disk_state("p1").unwrap().completed);
        assert!(matches!(
            registry.record_write("r1", 1),
            Err(ArchiveError::DiskCompleted { .. })
        ));
        // a refused reservation books nothing, not even on open members
        assert!(matches!(
            registry.reserve_set(&set, MEGABYTE),
            Err(ArchiveError::DiskCompleted { disk_id }) if disk_id == "r1"
        ));
        assert_eq!(registry.disk_state("p1").unwrap().used_bytes, 0);
        assert_eq!(notifier.disk_change.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn space_warning_fires_once() {
        let (registry, notifier) = build_registry(false, 100);
        registry.record_write("p1", 85 * MEGABYTE).unwrap();
        registry.record_write("p1", MEGABYTE).unwrap();
        assert_eq!(notifier.space_warning.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.disk_change.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_mime_type_is_reported() {
        let (registry, _) = build_registry(false, 100);
        assert!(registry.is_eligible_locally());
        assert!(matches!(
            registry.select_target_set("text/plain"),
            Err(ArchiveError::UnknownMimeType { .. })
        ));
        assert_eq!(registry.select_target_set("image/x-fits").unwrap().id, "set1");
    }

    #[test]
    fn operator_can_reopen_a_completed_disk() {
        let (registry, _) = build_registry(false, 30);
        registry.record_write("p1", 25 * MEGABYTE).unwrap();
        registry.release_write("p1", 25 * MEGABYTE).unwrap();
        registry.set_completed("p1", false).unwrap();
        assert!(registry.record_write("p1", MEGABYTE).is_ok());
    }
}
