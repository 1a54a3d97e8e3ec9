//! Replica commits.
//!
//! Synchronous storage sets stage their replicas inline. Asynchronous ones hand a
//! [`ReplicationJob`] to a background worker fed through a `crossbeam-channel`; its failures
//! land in the [`ReplicationMonitor`] and are repaired by replica reconciliation.
//!
//! Every stored copy is first written to a [`PendingCopy`] next to its final path and only
//! moved into place once its catalog row is written, so a failed commit never touches the
//! bytes an existing row points at.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{Catalog, RetryPolicy};
use crate::error::{ArchiveError, Result};
use crate::io::{copy_file, move_file, remove_if_exists};
use crate::locks::VersionLocks;
use crate::notify::{Notification, NotificationKind, Notifier, dispatch};
use crate::registry::DiskRegistry;
use crate::types::{Disk, FileCatalogEntry};

/// Catalog row for a replica of `primary`.
#[must_use]
pub fn replica_entry(primary: &FileCatalogEntry, replica_disk: &str) -> FileCatalogEntry {
    FileCatalogEntry {
        disk_id: replica_disk.to_string(),
        ..primary.clone()
    }
}

/// Hidden sibling of `relative` holding bytes until their catalog row exists. Stored names
/// never start with a dot, so it cannot alias another file version.
#[must_use]
pub fn pending_path(relative: &Path, token: &str) -> PathBuf {
    let name = relative
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    relative.with_file_name(format!(".{name}.{token}.pending"))
}

/// Give back the accounting of a copy that will not be cataloged.
pub(crate) fn release_accounting(registry: &DiskRegistry, disk_id: &str, size: u64) {
    if let Err(err) = registry.release_write(disk_id, size) {
        tracing::warn!(
            target = "archivist::replication",
            disk_id,
            error = %err,
            "failed to release accounting"
        );
    }
}

/// Refuse a final path that holds bytes `previous` does not own.
pub(crate) fn ensure_target_free(
    disk: &Disk,
    relative: &Path,
    previous: Option<&FileCatalogEntry>,
) -> Result<()> {
    let owned = previous.is_some_and(|old| old.filename == relative);
    let target = disk.resolve(relative);
    if !owned && target.exists() {
        return Err(ArchiveError::PathOccupied {
            disk_id: disk.disk_id.clone(),
            path: target,
        });
    }
    Ok(())
}

/// Bytes written next to their final location, waiting for their catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingCopy {
    pub disk_id: String,
    pub pending: PathBuf,
    pub target: PathBuf,
    primary: bool,
}

impl PendingCopy {
    pub(crate) fn new(disk: &Disk, relative: &Path, token: &str, primary: bool) -> Self {
        Self {
            disk_id: disk.disk_id.clone(),
            pending: disk.resolve(&pending_path(relative, token)),
            target: disk.resolve(relative),
            primary,
        }
    }

    pub(crate) fn write_error(&self, source: io::Error) -> ArchiveError {
        let disk_id = self.disk_id.clone();
        if self.primary {
            ArchiveError::PrimaryWrite { disk_id, source }
        } else {
            ArchiveError::ReplicaWrite { disk_id, source }
        }
    }

    /// Drop the pending bytes. Accounting is the caller's.
    pub(crate) fn remove(&self) {
        if let Err(err) = remove_if_exists(&self.pending) {
            tracing::warn!(
                target = "archivist::replication",
                path = %self.pending.display(),
                error = %err,
                "failed to remove pending copy"
            );
        }
    }
}

/// Copy `source` next to `relative` on a replica disk. Accounting is the caller's.
pub(crate) fn stage_replica(
    registry: &DiskRegistry,
    replica_disk: &str,
    relative: &Path,
    source: &Path,
    token: &str,
) -> Result<PendingCopy> {
    let disk = registry
        .disk(replica_disk)
        .ok_or_else(|| ArchiveError::Config(format!("unknown disk {replica_disk}")))?;
    let copy = PendingCopy::new(disk, relative, token, false);
    copy_file(source, &copy.pending).map_err(|err| copy.write_error(err))?;
    Ok(copy)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationJob {
    /// Primary row as committed; the job is dropped if the catalog moved on since.
    pub primary: FileCatalogEntry,
    pub replica_disk: String,
    /// The replica's bytes were booked with the storage set at commit time.
    pub reserved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFailure {
    pub file_id: String,
    pub version: u32,
    pub primary_disk: String,
    pub replica_disk: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Record of replica commits that did not complete.
#[derive(Debug, Default)]
pub struct ReplicationMonitor {
    failures: Mutex<Vec<ReplicationFailure>>,
}

impl ReplicationMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, job: &ReplicationJob, reason: &ArchiveError, notifier: &dyn Notifier) {
        let failure = ReplicationFailure {
            file_id: job.primary.file_id.clone(),
            version: job.primary.version,
            primary_disk: job.primary.disk_id.clone(),
            replica_disk: job.replica_disk.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        tracing::error!(
            target = "archivist::replication",
            file_id = %failure.file_id,
            version = failure.version,
            replica_disk = %failure.replica_disk,
            error = %failure.reason,
            "replica commit failed"
        );
        dispatch(
            notifier,
            &Notification::new(NotificationKind::ReplicationFailure, &failure.file_id)
                .with_detail("version", failure.version)
                .with_detail("primary_disk", &failure.primary_disk)
                .with_detail("replica_disk", &failure.replica_disk)
                .with_detail("reason", &failure.reason),
        );
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }

    /// Outstanding failures, oldest first.
    #[must_use]
    pub fn failures(&self) -> Vec<ReplicationFailure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget failures for a replica that has since been repaired.
    pub(crate) fn resolve(&self, file_id: &str, version: u32, replica_disk: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|f| !(f.file_id == file_id && f.version == version && f.replica_disk == replica_disk));
    }
}

/// Everything the replication worker needs, shared with the archiver.
pub(crate) struct ReplicationShared {
    pub registry: Arc<DiskRegistry>,
    pub catalog: Arc<dyn Catalog>,
    pub retry: RetryPolicy,
    pub locks: Arc<VersionLocks>,
    pub notifier: Arc<dyn Notifier>,
    pub monitor: Arc<ReplicationMonitor>,
}

/// Outcome of one replica commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplicaOutcome {
    Committed,
    /// The primary row changed or disappeared; the copy would be stale.
    Superseded,
}

impl ReplicationShared {
    /// Commit one replica under the file-id lock, so it cannot race a newer archive of the
    /// same file id. Unreserved jobs book the replica disk first, which fails once that disk
    /// is completed.
    pub(crate) fn replicate(&self, job: &ReplicationJob) -> Result<ReplicaOutcome> {
        if !job.reserved {
            self.registry
                .record_write(&job.replica_disk, job.primary.size)?;
        }
        let outcome = self.replicate_booked(job);
        if !matches!(outcome, Ok(ReplicaOutcome::Committed)) {
            release_accounting(&self.registry, &job.replica_disk, job.primary.size);
        }
        outcome
    }

    fn replicate_booked(&self, job: &ReplicationJob) -> Result<ReplicaOutcome> {
        let primary = &job.primary;
        let _guard = self.locks.lock(&primary.file_id)?;
        let current = self.retry.run("get_file_location", || {
            self.catalog
                .get_file_location(&primary.file_id, primary.version, Some(&primary.disk_id))
        })?;
        let still_current = current
            .first()
            .is_some_and(|row| row.filename == primary.filename && row.same_content(primary));
        if !still_current {
            tracing::debug!(
                target = "archivist::replication",
                file_id = %primary.file_id,
                version = primary.version,
                "primary row superseded; skipping replica"
            );
            return Ok(ReplicaOutcome::Superseded);
        }

        let previous = self
            .retry
            .run("get_file_location", || {
                self.catalog
                    .get_file_location(&primary.file_id, primary.version, Some(&job.replica_disk))
            })?
            .into_iter()
            .next();
        let (source_disk, target_disk) = match (
            self.registry.disk(&primary.disk_id),
            self.registry.disk(&job.replica_disk),
        ) {
            (Some(source), Some(target)) => (source, target),
            _ => {
                return Err(ArchiveError::Config(format!(
                    "unknown disk {} or {}",
                    primary.disk_id, job.replica_disk
                )));
            }
        };
        ensure_target_free(target_disk, &primary.filename, previous.as_ref())?;
        let copy = stage_replica(
            &self.registry,
            &job.replica_disk,
            &primary.filename,
            &source_disk.resolve(&primary.filename),
            &Uuid::new_v4().to_string(),
        )?;
        let entry = replica_entry(primary, &job.replica_disk);
        if let Err(err) = self.publish(&copy, &entry, previous.as_ref()) {
            copy.remove();
            return Err(err);
        }
        if let Some(old) = &previous {
            self.drop_replaced(old, &entry);
        }
        self.monitor
            .resolve(&primary.file_id, primary.version, &job.replica_disk);
        tracing::debug!(
            target = "archivist::replication",
            file_id = %primary.file_id,
            version = primary.version,
            replica_disk = %job.replica_disk,
            "replica committed"
        );
        Ok(ReplicaOutcome::Committed)
    }

    /// Write `row`, then move the pending bytes over its final path. On failure the catalog
    /// holds `previous` again and the pending copy is left for the caller.
    pub(crate) fn publish(
        &self,
        copy: &PendingCopy,
        row: &FileCatalogEntry,
        previous: Option<&FileCatalogEntry>,
    ) -> Result<()> {
        self.retry
            .run("insert_or_replace_file", || self.catalog.insert_or_replace_file(row))?;
        if let Err(err) = move_file(&copy.pending, &copy.target) {
            self.restore_row(row, previous);
            return Err(copy.write_error(err));
        }
        Ok(())
    }

    fn restore_row(&self, row: &FileCatalogEntry, previous: Option<&FileCatalogEntry>) {
        let restored = match previous {
            Some(old) => self
                .retry
                .run("insert_or_replace_file", || self.catalog.insert_or_replace_file(old)),
            None => self.retry.run("delete_file", || {
                self.catalog.delete_file(&row.file_id, row.version, &row.disk_id)
            })
            .map(|_| ()),
        };
        if let Err(err) = restored {
            tracing::error!(
                target = "archivist::replication",
                file_id = %row.file_id,
                version = row.version,
                disk_id = %row.disk_id,
                error = %err,
                "failed to restore catalog row after a failed move"
            );
        }
    }

    /// Remove bytes of a row that `replacement` overwrote, when they lived at another path.
    pub(crate) fn drop_replaced(&self, old: &FileCatalogEntry, replacement: &FileCatalogEntry) {
        if old.filename != replacement.filename {
            if let Some(disk) = self.registry.disk(&old.disk_id) {
                if let Err(err) = remove_if_exists(&disk.resolve(&old.filename)) {
                    tracing::warn!(
                        target = "archivist::replication",
                        disk_id = %old.disk_id,
                        path = %old.filename.display(),
                        error = %err,
                        "failed to remove replaced file"
                    );
                }
            }
        }
        if let Err(err) = self.registry.release_write(&old.disk_id, old.size) {
            tracing::warn!(
                target = "archivist::replication",
                disk_id = %old.disk_id,
                error = %err,
                "failed to release replaced file accounting"
            );
        }
    }
}

struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Background worker running asynchronous replica commits in submission order.
pub(crate) struct ReplicationQueue {
    sender: Option<Sender<ReplicationJob>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<Pending>,
    submitted: AtomicUsize,
}

impl ReplicationQueue {
    pub(crate) fn spawn(shared: Arc<ReplicationShared>) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });
        let worker_pending = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name("archivist-replication".into())
            .spawn(move || run_worker(&shared, &receiver, &worker_pending))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            pending,
            submitted: AtomicUsize::new(0),
        })
    }

    pub(crate) fn submit(&self, job: ReplicationJob) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ArchiveError::Lock("replication queue closed".into()))?;
        *self.pending.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        sender.send(job).map_err(|_| {
            *self.pending.count.lock().unwrap_or_else(PoisonError::into_inner) -= 1;
            ArchiveError::Lock("replication worker stopped".into())
        })
    }

    /// Block until every submitted job finished or `timeout` elapsed. Returns whether the
    /// queue drained.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.pending.idle.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub(crate) fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }
}

impl Drop for ReplicationQueue {
    fn drop(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(target = "archivist::replication", "replication worker panicked");
            }
        }
    }
}

fn run_worker(shared: &ReplicationShared, receiver: &Receiver<ReplicationJob>, pending: &Pending) {
    for job in receiver {
        if let Err(err) = shared.replicate(&job) {
            shared
                .monitor
                .record(&job, &err, shared.notifier.as_ref());
        }
        let mut count = pending.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            pending.idle.notify_all();
        }
    }
    tracing::debug!(target = "archivist::replication", "replication worker stopped");
}
