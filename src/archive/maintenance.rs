//! Operator and background operations on an open archiver.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backlog::BackLogEntry;
use crate::checksum::checksum_file;
use crate::commit::{CommitFailure, CommitReport};
use crate::error::{ArchiveError, FailureClass, Result};
use crate::io::{copy_file, remove_if_exists};
use crate::quarantine::{QuarantineTag, sweep_staging};
use crate::replication::{ReplicaOutcome, ReplicationFailure, ReplicationJob};
use crate::types::FileCatalogEntry;

use super::Archiver;

/// Result of one back-log sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    /// Failed again for a retryable reason and stay buffered.
    pub still_buffered: usize,
    pub quarantined: usize,
    /// Claimed by a concurrent sweep.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStatus {
    Ok,
    Mismatch { expected: String, actual: String },
    Missing,
    /// The row carries no checksum, so the copy cannot be vouched for.
    NoChecksum,
}

impl VerifyStatus {
    /// Only a matching checksum passes.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub file_id: String,
    pub version: u32,
    pub disk_id: String,
    pub path: PathBuf,
    pub status: VerifyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardReport {
    pub file_id: String,
    pub version: u32,
    pub disk_id: String,
    pub path: PathBuf,
    /// `false` for a dry run.
    pub executed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub repaired: usize,
    pub failed: usize,
}

impl Archiver {
    /// Move a file into the bad-files area on operator request.
    pub fn quarantine(&self, path: &Path) -> Result<PathBuf> {
        let target = self.bad_files.quarantine(path, QuarantineTag::Manual)?;
        tracing::info!(
            target = "archivist::maintenance",
            from = %path.display(),
            to = %target.display(),
            "file quarantined on request"
        );
        Ok(target)
    }

    /// Quarantine every leftover scratch file in the staging areas. Only safe while no
    /// request is in flight.
    pub fn recover_staging(&self) -> Result<Vec<PathBuf>> {
        let mut recovered = Vec::new();
        for disk in self.registry.disks() {
            recovered.extend(sweep_staging(&disk.staging_dir(), &self.bad_files)?);
        }
        Ok(recovered)
    }

    /// Re-drive every buffered request through commit. Entries held by another sweep are
    /// skipped.
    pub fn replay_backlog(&self) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        for mut entry in self.backlog.entries()? {
            let _lock = match self.backlog.try_lock(&entry) {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(
                        target = "archivist::maintenance",
                        entry = %entry.record_path.display(),
                        error = %err,
                        "cannot claim back-log entry"
                    );
                    report.skipped += 1;
                    continue;
                }
            };
            let request_id = entry.record.request.request_id;
            match self.replay_entry(&entry) {
                Ok(committed) => {
                    self.backlog.remove(&entry)?;
                    report.replayed += 1;
                    tracing::info!(
                        target = "archivist::maintenance",
                        request_id = %request_id,
                        file_id = %committed.entry.file_id,
                        version = committed.entry.version,
                        disk_id = %committed.entry.disk_id,
                        attempts = entry.record.attempts + 1,
                        disposition = "committed",
                        "back-log entry replayed"
                    );
                }
                Err(err) if err.class() == FailureClass::Retryable => {
                    self.backlog.record_attempt(&mut entry, &err)?;
                    report.still_buffered += 1;
                    tracing::warn!(
                        target = "archivist::maintenance",
                        request_id = %request_id,
                        attempts = entry.record.attempts,
                        disposition = "buffered",
                        error = %err,
                        "back-log replay failed; entry kept"
                    );
                }
                Err(err) => {
                    let target = self.bad_files.quarantine_copy(
                        &entry.data_path,
                        &entry.record.data_file,
                        &entry.record.request,
                        QuarantineTag::Unretryable,
                    )?;
                    self.backlog.remove(&entry)?;
                    report.quarantined += 1;
                    tracing::warn!(
                        target = "archivist::maintenance",
                        request_id = %request_id,
                        disposition = "quarantined",
                        code = %err.code(),
                        error = %err,
                        path = %target.display(),
                        "back-log entry failed permanently"
                    );
                }
            }
        }
        tracing::info!(
            target = "archivist::maintenance",
            replayed = report.replayed,
            still_buffered = report.still_buffered,
            quarantined = report.quarantined,
            skipped = report.skipped,
            "back-log sweep finished"
        );
        Ok(report)
    }

    fn replay_entry(&self, entry: &BackLogEntry) -> Result<CommitReport> {
        let request = &entry.record.request;
        let validated = &entry.record.validated;
        let routing_mime = self.resolve_mime_type(request)?;
        let set = self.registry.select_target_set(&routing_mime)?;
        let disk = self
            .registry
            .disk(&set.primary)
            .ok_or_else(|| ArchiveError::Config(format!("unknown disk {}", set.primary)))?;
        let staged = disk.staging_dir().join(request.scratch_name());
        // copied: a committed primary never shares an inode with a back-log entry
        copy_file(&entry.data_path, &staged)?;
        match self.commit_with_reselect(request, validated, &staged, &routing_mime, set) {
            Ok(report) => Ok(report),
            Err(CommitFailure {
                error,
                primary_copy,
            }) => {
                match primary_copy {
                    // committed primary bytes stay where they are
                    Some(path) => tracing::debug!(
                        target = "archivist::maintenance",
                        path = %path.display(),
                        "replay failed after primary commit"
                    ),
                    None => {
                        if let Err(err) = remove_if_exists(&staged) {
                            tracing::warn!(
                                target = "archivist::maintenance",
                                path = %staged.display(),
                                error = %err,
                                "failed to remove replay staging link"
                            );
                        }
                    }
                }
                Err(error)
            }
        }
    }

    /// Re-checksum the stored copies of a file version against their catalog rows.
    pub fn verify_file(
        &self,
        file_id: &str,
        version: u32,
        disk_id: Option<&str>,
    ) -> Result<Vec<VerifyReport>> {
        let rows = self.config.catalog_retry.run("get_file_location", || {
            self.catalog.get_file_location(file_id, version, disk_id)
        })?;
        if rows.is_empty() {
            return Err(ArchiveError::FileNotFound {
                file_id: file_id.to_string(),
                version,
            });
        }
        let mut reports = Vec::with_capacity(rows.len());
        for row in rows {
            let path = self
                .registry
                .disk(&row.disk_id)
                .map_or_else(|| row.filename.clone(), |d| d.resolve(&row.filename));
            let status = if !path.is_file() {
                VerifyStatus::Missing
            } else if let Some(expected) = row.stored_checksum() {
                let actual = checksum_file(&path, expected.variant)?;
                if actual.value == expected.value {
                    VerifyStatus::Ok
                } else {
                    VerifyStatus::Mismatch {
                        expected: expected.value,
                        actual: actual.value,
                    }
                }
            } else {
                VerifyStatus::NoChecksum
            };
            if !status.is_ok() {
                tracing::warn!(
                    target = "archivist::maintenance",
                    file_id,
                    version,
                    disk_id = %row.disk_id,
                    status = ?status,
                    "stored copy failed verification"
                );
            }
            reports.push(VerifyReport {
                file_id: row.file_id,
                version: row.version,
                disk_id: row.disk_id,
                path,
                status,
            });
        }
        Ok(reports)
    }

    /// Remove one stored copy and its catalog row. Without `execute` only reports what
    /// would be removed.
    pub fn discard(
        &self,
        file_id: &str,
        version: u32,
        disk_id: &str,
        execute: bool,
    ) -> Result<DiscardReport> {
        if !self.config.allow_remove_requests {
            return Err(ArchiveError::RemoveNotAllowed);
        }
        let shared = &self.committer.shared;
        let _guard = shared.locks.lock(file_id)?;
        let row = self
            .config
            .catalog_retry
            .run("get_file_location", || {
                self.catalog.get_file_location(file_id, version, Some(disk_id))
            })?
            .into_iter()
            .next()
            .ok_or_else(|| ArchiveError::FileNotFound {
                file_id: file_id.to_string(),
                version,
            })?;
        let disk = self
            .registry
            .disk(disk_id)
            .ok_or_else(|| ArchiveError::Config(format!("unknown disk {disk_id}")))?;
        let path = disk.resolve(&row.filename);
        let mut report = DiscardReport {
            file_id: file_id.to_string(),
            version,
            disk_id: disk_id.to_string(),
            path,
            executed: false,
        };
        if !execute {
            return Ok(report);
        }
        self.config.catalog_retry.run("delete_file", || {
            self.catalog.delete_file(file_id, version, disk_id)
        })?;
        remove_if_exists(&report.path)?;
        self.registry.release_write(disk_id, row.size)?;
        report.executed = true;
        tracing::info!(
            target = "archivist::maintenance",
            file_id,
            version,
            disk_id,
            path = %report.path.display(),
            "stored copy discarded"
        );
        Ok(report)
    }

    /// Files under a disk's content area that no catalog row points at, relative to the
    /// mount point.
    pub fn find_orphans(&self, disk_id: &str) -> Result<Vec<PathBuf>> {
        let disk = self
            .registry
            .disk(disk_id)
            .ok_or_else(|| ArchiveError::Config(format!("unknown disk {disk_id}")))?;
        let cataloged: HashSet<PathBuf> = self
            .config
            .catalog_retry
            .run("list_files", || self.catalog.list_files(disk_id))?
            .into_iter()
            .map(|row| row.filename)
            .collect();
        let mut orphans = Vec::new();
        let mut pending = vec![disk.content_dir()];
        while let Some(dir) = pending.pop() {
            if !dir.is_dir() {
                continue;
            }
            for entry in fs_err::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&disk.mount_path)
                    .map_or_else(|_| path.clone(), Path::to_path_buf);
                if !cataloged.contains(&relative) {
                    orphans.push(relative);
                }
            }
        }
        orphans.sort();
        Ok(orphans)
    }

    /// Re-create missing or stale replicas of every primary row, storage set by storage set.
    pub fn reconcile_replicas(&self) -> Result<ReconcileReport> {
        let shared = &self.committer.shared;
        let retry = self.config.catalog_retry;
        let mut report = ReconcileReport::default();
        for set in self.registry.storage_sets() {
            if set.replicas.is_empty() {
                continue;
            }
            let primaries = retry.run("list_files", || self.catalog.list_files(&set.primary))?;
            for primary in primaries {
                for replica in &set.replicas {
                    report.checked += 1;
                    if self.replica_is_healthy(&primary, replica)? {
                        continue;
                    }
                    let job = ReplicationJob {
                        primary: primary.clone(),
                        replica_disk: replica.clone(),
                        reserved: false,
                    };
                    match shared.replicate(&job) {
                        Ok(ReplicaOutcome::Committed) => report.repaired += 1,
                        Ok(ReplicaOutcome::Superseded) => {}
                        Err(err) => {
                            report.failed += 1;
                            shared.monitor.record(&job, &err, shared.notifier.as_ref());
                        }
                    }
                }
            }
        }
        tracing::info!(
            target = "archivist::maintenance",
            checked = report.checked,
            repaired = report.repaired,
            failed = report.failed,
            "replica reconciliation finished"
        );
        Ok(report)
    }

    fn replica_is_healthy(&self, primary: &FileCatalogEntry, replica: &str) -> Result<bool> {
        let rows = self.config.catalog_retry.run("get_file_location", || {
            self.catalog
                .get_file_location(&primary.file_id, primary.version, Some(replica))
        })?;
        let Some(disk) = self.registry.disk(replica) else {
            return Ok(false);
        };
        Ok(rows
            .first()
            .is_some_and(|row| row.same_content(primary) && disk.resolve(&row.filename).is_file()))
    }

    /// Block until queued asynchronous replicas are done or `timeout` elapses.
    #[must_use]
    pub fn wait_for_replication(&self, timeout: Duration) -> bool {
        self.committer.queue.wait_idle(timeout)
    }

    /// Replica commits that failed and are not yet repaired.
    #[must_use]
    pub fn replication_failures(&self) -> Vec<ReplicationFailure> {
        self.committer.shared.monitor.failures()
    }

    /// Asynchronous replica jobs submitted since open.
    #[must_use]
    pub fn replication_jobs_submitted(&self) -> usize {
        self.committer.queue.submitted()
    }
}
