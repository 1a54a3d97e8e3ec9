//! Commit and replication coordinator.
//!
//! Takes a validated file and moves it through
//! `Validated -> PrimaryCommitted -> ReplicaCommitted -> CatalogUpdated`. Capacity for the
//! whole storage set is booked up front. Every copy is written beside its final path and
//! moved into place only after its catalog row is written, so rows of a version being
//! replaced keep pointing at their own bytes until the replacement is cataloged. Failures
//! report the stage they happened in, because the caller disposes of the bytes differently
//! before and after the primary copy exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::catalog::{Catalog, RetryPolicy};
use crate::checksum::Checksum;
use crate::constants::CONTENT_DIR;
use crate::error::{ArchiveError, Result};
use crate::io::{move_file, remove_if_exists};
use crate::replication::{
    PendingCopy, ReplicationJob, ReplicationQueue, ReplicationShared, ensure_target_free,
    release_accounting, replica_entry, stage_replica,
};
use crate::types::{
    ArchiveRequest, FileCatalogEntry, StorageSet, ValidatedFile, VersionRequest,
};

/// Single path component for a file id. Bytes outside `[A-Za-z0-9._-]`, and a leading dot,
/// are written as `%XX`, so distinct ids never share a name and no name starts with a dot.
#[must_use]
pub fn storage_name(file_id: &str) -> String {
    if file_id.is_empty() {
        return "%".to_string();
    }
    let mut name = String::with_capacity(file_id.len());
    for (index, byte) in file_id.bytes().enumerate() {
        match byte {
            b'.' if index == 0 => name.push_str("%2E"),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                name.push(char::from(byte));
            }
            _ => name.push_str(&format!("%{byte:02X}")),
        }
    }
    name
}

/// Deterministic location of a file version, relative to the disk mount point.
#[must_use]
pub fn content_path(accepted_at: DateTime<Utc>, file_id: &str, version: u32) -> PathBuf {
    Path::new(CONTENT_DIR)
        .join(accepted_at.format("%Y-%m-%d").to_string())
        .join(version.to_string())
        .join(storage_name(file_id))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub entry: FileCatalogEntry,
    /// Replicas written and cataloged before returning.
    pub replicas: Vec<String>,
    /// Replicas handed to the background worker.
    pub queued_replicas: Vec<String>,
}

/// A failed commit and where the bytes are now.
#[derive(Debug)]
pub struct CommitFailure {
    pub error: ArchiveError,
    /// `Some` once the bytes were moved onto the primary disk. They stay there and the
    /// caller must take a copy; `None` means the source file is untouched.
    pub primary_copy: Option<PathBuf>,
}

impl CommitFailure {
    fn before_primary(error: impl Into<ArchiveError>) -> Self {
        Self {
            error: error.into(),
            primary_copy: None,
        }
    }

    fn after_primary(error: impl Into<ArchiveError>, path: &Path) -> Self {
        Self {
            error: error.into(),
            primary_copy: Some(path.to_path_buf()),
        }
    }
}

pub(crate) struct CommitCoordinator {
    pub shared: Arc<ReplicationShared>,
    pub queue: ReplicationQueue,
    pub host_id: String,
}

impl CommitCoordinator {
    fn catalog(&self) -> &dyn Catalog {
        self.shared.catalog.as_ref()
    }

    fn retry(&self) -> RetryPolicy {
        self.shared.retry
    }

    /// Version a new copy of `file_id` receives.
    fn allocate_version(
        &self,
        request: &ArchiveRequest,
        file_id: &str,
    ) -> Result<u32> {
        let max = self
            .retry()
            .run("get_max_version", || self.catalog().get_max_version(file_id))?;
        Ok(match (request.version, request.no_versioning) {
            (VersionRequest::Explicit(version), _) => version,
            (VersionRequest::Auto, true) => max.unwrap_or(1),
            (VersionRequest::Auto, false) => max.unwrap_or(0) + 1,
        })
    }

    fn release_replicas(&self, set: &StorageSet, size: u64) {
        for replica in &set.replicas {
            release_accounting(&self.shared.registry, replica, size);
        }
    }

    /// Commit `source` (the validated bytes) onto `set`.
    pub(crate) fn commit(
        &self,
        request: &ArchiveRequest,
        validated: &ValidatedFile,
        source: &Path,
        set: &StorageSet,
    ) -> std::result::Result<CommitReport, CommitFailure> {
        let registry = &self.shared.registry;
        let primary_disk = registry
            .disk(&set.primary)
            .ok_or_else(|| {
                CommitFailure::before_primary(ArchiveError::Config(format!(
                    "unknown disk {}",
                    set.primary
                )))
            })?
            .clone();

        let guard = self
            .shared
            .locks
            .lock(&validated.file_id)
            .map_err(CommitFailure::before_primary)?;
        let version = self
            .allocate_version(request, &validated.file_id)
            .map_err(CommitFailure::before_primary)?;
        let relative = content_path(request.accepted_at, &validated.file_id, version);
        let replaced = self
            .retry()
            .run("get_file_location", || {
                self.catalog()
                    .get_file_location(&validated.file_id, version, None)
            })
            .map_err(CommitFailure::before_primary)?;
        let previous = |disk_id: &str| replaced.iter().find(|old| old.disk_id == disk_id);

        let synchronous: &[String] = if set.synchronize { &set.replicas } else { &[] };
        for disk_id in std::iter::once(&set.primary).chain(synchronous) {
            if let Some(disk) = registry.disk(disk_id) {
                ensure_target_free(disk, &relative, previous(disk_id.as_str()))
                    .map_err(CommitFailure::before_primary)?;
            }
        }

        // Validated -> PrimaryCommitted
        registry
            .reserve_set(set, validated.size)
            .map_err(CommitFailure::before_primary)?;
        let token = request.request_id.to_string();
        let primary_copy = PendingCopy::new(&primary_disk, &relative, &token, true);
        if let Err(err) = move_file(source, &primary_copy.pending) {
            release_accounting(registry, &primary_disk.disk_id, validated.size);
            self.release_replicas(set, validated.size);
            return Err(CommitFailure::before_primary(primary_copy.write_error(err)));
        }
        let kept = primary_copy.pending.as_path();
        tracing::debug!(
            target = "archivist::commit",
            request_id = %request.request_id,
            file_id = %validated.file_id,
            version,
            path = %kept.display(),
            "primary committed"
        );

        let entry = self.primary_entry(validated, version, &primary_disk.disk_id, &relative);

        // PrimaryCommitted -> ReplicaCommitted
        let mut replica_copies = Vec::with_capacity(synchronous.len());
        for replica in synchronous {
            match stage_replica(registry, replica, &relative, kept, &token) {
                Ok(copy) => replica_copies.push(copy),
                Err(err) => {
                    replica_copies.iter().for_each(PendingCopy::remove);
                    self.release_replicas(set, entry.size);
                    return Err(CommitFailure::after_primary(err, kept));
                }
            }
        }

        // ReplicaCommitted -> CatalogUpdated
        if let Err(err) = self
            .shared
            .publish(&primary_copy, &entry, previous(entry.disk_id.as_str()))
        {
            replica_copies.iter().for_each(PendingCopy::remove);
            self.release_replicas(set, entry.size);
            return Err(CommitFailure::after_primary(err, kept));
        }
        let mut cataloged = Vec::with_capacity(replica_copies.len());
        for copy in &replica_copies {
            let row = replica_entry(&entry, &copy.disk_id);
            match self.shared.publish(copy, &row, previous(copy.disk_id.as_str())) {
                Ok(()) => cataloged.push(copy.disk_id.clone()),
                Err(err) => {
                    // the primary row stands; reconciliation restores this replica
                    copy.remove();
                    release_accounting(registry, &copy.disk_id, entry.size);
                    self.shared.monitor.record(
                        &ReplicationJob {
                            primary: entry.clone(),
                            replica_disk: copy.disk_id.clone(),
                            reserved: false,
                        },
                        &err,
                        self.shared.notifier.as_ref(),
                    );
                }
            }
        }
        for old in &replaced {
            if old.disk_id == entry.disk_id || cataloged.contains(&old.disk_id) {
                let replacement = replica_entry(&entry, &old.disk_id);
                self.shared.drop_replaced(old, &replacement);
            } else if !set.contains(&old.disk_id) {
                self.retire(old);
            }
            // other members of the set are replaced by their pending replica commit
        }
        drop(guard);

        let mut queued_replicas = Vec::new();
        if !set.synchronize {
            for replica in &set.replicas {
                let job = ReplicationJob {
                    primary: entry.clone(),
                    replica_disk: replica.clone(),
                    reserved: true,
                };
                match self.queue.submit(job.clone()) {
                    Ok(()) => queued_replicas.push(replica.clone()),
                    Err(err) => {
                        release_accounting(registry, replica, entry.size);
                        self.shared
                            .monitor
                            .record(&job, &err, self.shared.notifier.as_ref());
                    }
                }
            }
        }

        Ok(CommitReport {
            entry,
            replicas: cataloged,
            queued_replicas,
        })
    }

    /// Remove a row of the same file version held outside the target storage set.
    fn retire(&self, old: &FileCatalogEntry) {
        let deleted = self.retry().run("delete_file", || {
            self.catalog()
                .delete_file(&old.file_id, old.version, &old.disk_id)
        });
        if let Err(err) = deleted {
            tracing::warn!(
                target = "archivist::commit",
                file_id = %old.file_id,
                version = old.version,
                disk_id = %old.disk_id,
                error = %err,
                "failed to retire replaced row"
            );
            return;
        }
        let registry = &self.shared.registry;
        if let Some(disk) = registry.disk(&old.disk_id) {
            if let Err(err) = remove_if_exists(&disk.resolve(&old.filename)) {
                tracing::warn!(
                    target = "archivist::commit",
                    disk_id = %old.disk_id,
                    path = %old.filename.display(),
                    error = %err,
                    "failed to remove replaced file"
                );
            }
        }
        if let Err(err) = registry.release_write(&old.disk_id, old.size) {
            tracing::warn!(
                target = "archivist::commit",
                disk_id = %old.disk_id,
                error = %err,
                "failed to release replaced file accounting"
            );
        }
    }

    fn primary_entry(
        &self,
        validated: &ValidatedFile,
        version: u32,
        disk_id: &str,
        relative: &Path,
    ) -> FileCatalogEntry {
        let (checksum, checksum_plugin) = match &validated.checksum {
            Some(Checksum { variant, value }) => {
                (Some(value.clone()), Some(variant.plugin_id().to_string()))
            }
            None => (None, None),
        };
        FileCatalogEntry {
            file_id: validated.file_id.clone(),
            version,
            disk_id: disk_id.to_string(),
            filename: relative.to_path_buf(),
            size: validated.size,
            checksum,
            checksum_plugin,
            ingested_at: Utc::now(),
            mime_type: validated.mime_type.clone(),
            host_id: self.host_id.clone(),
            metadata: validated.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn content_path_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(
            content_path(at, "OBS/1", 4),
            Path::new("saf/2024-03-09/4/OBS%2F1")
        );
        assert_eq!(
            content_path(at, "obs.fits", 1),
            Path::new("saf/2024-03-09/1/obs.fits")
        );
    }

    #[test]
    fn distinct_file_ids_never_share_a_name() {
        let ids = [
            "a/b", "a_b", "a%2Fb", "a\\b", "..", ".", "%2E.", "", "%", "obs 1", "obs\u{e9}",
            "obs\u{c3}",
        ];
        let names: std::collections::BTreeSet<String> =
            ids.iter().map(|id| storage_name(id)).collect();
        assert_eq!(names.len(), ids.len(), "{names:?}");
        for name in &names {
            assert!(!name.is_empty());
            assert!(!name.starts_with('.'));
            assert!(!name.contains(['/', '\\']));
        }
    }
}
