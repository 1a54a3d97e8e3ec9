//! Back-log buffer: durable deferral of validated requests that failed for a retryable reason.
//!
//! Each entry is a data file plus a versioned JSON record, both named after the request's
//! scratch name. The data file is written first and the record last, so a record on disk
//! always has its bytes next to it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::constants::{BACKLOG_RECORD_EXT, BACKLOG_RECORD_VERSION};
use crate::error::{ArchiveError, ErrorCode, Result};
use crate::io::{copy_file, move_file, read_json, remove_if_exists, write_json_atomic};
use crate::types::{ArchiveRequest, ValidatedFile};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackLogFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&ArchiveError> for BackLogFailure {
    fn from(err: &ArchiveError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// On-disk description of a deferred request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackLogRecord {
    pub format_version: u32,
    pub request: ArchiveRequest,
    pub validated: ValidatedFile,
    /// Name of the data file, relative to the back-log area.
    pub data_file: String,
    pub failure: BackLogFailure,
    pub deferred_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct BackLogEntry {
    pub record_path: PathBuf,
    pub data_path: PathBuf,
    pub record: BackLogRecord,
}

/// Exclusive claim on one entry, released on drop.
#[derive(Debug)]
pub struct EntryLock {
    _file: fs_err::File,
}

#[derive(Debug, Clone)]
pub struct BackLogBuffer {
    dir: PathBuf,
}

impl BackLogBuffer {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Buffer `source` for `request`. With `keep_source` the bytes are copied (the source is
    /// a committed primary file); otherwise they are moved out of staging.
    pub fn defer(
        &self,
        request: &ArchiveRequest,
        validated: &ValidatedFile,
        source: &Path,
        keep_source: bool,
        cause: &ArchiveError,
    ) -> Result<BackLogEntry> {
        let name = request.scratch_name();
        let data_path = self.dir.join(&name);
        let record_path = self.dir.join(format!("{name}.{BACKLOG_RECORD_EXT}"));
        if keep_source {
            copy_file(source, &data_path)?;
        } else {
            move_file(source, &data_path)?;
        }
        let record = BackLogRecord {
            format_version: BACKLOG_RECORD_VERSION,
            request: request.clone(),
            validated: validated.clone(),
            data_file: name,
            failure: cause.into(),
            deferred_at: Utc::now(),
            attempts: 0,
        };
        if let Err(err) = write_json_atomic(&record_path, &record) {
            // put the bytes back where the caller expects them
            let restored = if keep_source {
                remove_if_exists(&data_path).map(|_| ())
            } else {
                move_file(&data_path, source)
            };
            if let Err(restore_err) = restored {
                tracing::error!(
                    target = "archivist::backlog",
                    data = %data_path.display(),
                    error = %restore_err,
                    "failed to undo back-log data write"
                );
            }
            return Err(err);
        }
        tracing::debug!(
            target = "archivist::backlog",
            request_id = %request.request_id,
            file_id = %validated.file_id,
            code = %record.failure.code,
            reason = %record.failure.message,
            "request deferred to back-log"
        );
        Ok(BackLogEntry {
            record_path,
            data_path,
            record,
        })
    }

    /// Every readable entry, oldest first. Unreadable or foreign-version records are
    /// skipped with a warning so one bad record never blocks the rest.
    pub fn entries(&self) -> Result<Vec<BackLogEntry>> {
        let suffix = format!(".{BACKLOG_RECORD_EXT}");
        let mut entries = Vec::new();
        for dir_entry in fs_err::read_dir(&self.dir)? {
            let record_path = dir_entry?.path();
            let is_record = record_path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix));
            if !is_record {
                continue;
            }
            match self.load(&record_path) {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::warn!(
                    target = "archivist::backlog",
                    record = %record_path.display(),
                    error = %err,
                    "skipping unusable back-log record"
                ),
            }
        }
        entries.sort_by(|a, b| a.record.deferred_at.cmp(&b.record.deferred_at));
        Ok(entries)
    }

    fn load(&self, record_path: &Path) -> Result<BackLogEntry> {
        let record: BackLogRecord = read_json(record_path)?;
        if record.format_version != BACKLOG_RECORD_VERSION {
            return Err(ArchiveError::BackLogRecord {
                path: record_path.to_path_buf(),
                reason: format!("unsupported format version {}", record.format_version),
            });
        }
        let data_path = self.dir.join(&record.data_file);
        if !data_path.is_file() {
            return Err(ArchiveError::BackLogRecord {
                path: record_path.to_path_buf(),
                reason: "data file is missing".into(),
            });
        }
        Ok(BackLogEntry {
            record_path: record_path.to_path_buf(),
            data_path,
            record,
        })
    }

    /// Claim an entry for replay. `None` when another sweep holds it.
    pub fn try_lock(&self, entry: &BackLogEntry) -> Result<Option<EntryLock>> {
        let file = fs_err::File::open(&entry.data_path)?;
        match file.file().try_lock_exclusive() {
            Ok(()) => Ok(Some(EntryLock { _file: file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Record a failed replay attempt that leaves the entry buffered.
    pub fn record_attempt(&self, entry: &mut BackLogEntry, cause: &ArchiveError) -> Result<()> {
        entry.record.attempts += 1;
        entry.record.failure = cause.into();
        write_json_atomic(&entry.record_path, &entry.record)
    }

    /// Drop an entry after a successful replay or a hand-off to quarantine.
    pub fn remove(&self, entry: &BackLogEntry) -> Result<()> {
        remove_if_exists(&entry.record_path)?;
        remove_if_exists(&entry.data_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogError;
    use std::collections::BTreeMap;

    fn validated() -> ValidatedFile {
        ValidatedFile {
            file_id: "obs.fits".into(),
            mime_type: "image/x-fits".into(),
            size: 3,
            checksum: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn defer_moves_bytes_and_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("staged");
        fs_err::write(&src, b"abc").unwrap();
        let buffer = BackLogBuffer::new(dir.path().join("back-log")).unwrap();
        let request = ArchiveRequest::push("obs.fits");
        let cause = ArchiveError::Catalog(CatalogError::transient("db down"));

        let entry = buffer
            .defer(&request, &validated(), &src, false, &cause)
            .unwrap();
        assert!(!src.exists());
        assert_eq!(fs_err::read(&entry.data_path).unwrap(), b"abc");
        assert_eq!(entry.record.failure.code, ErrorCode::CatalogUnavailable);

        let mut listed = buffer.entries().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record.request, request);

        buffer.record_attempt(&mut listed[0], &cause).unwrap();
        assert_eq!(buffer.entries().unwrap()[0].record.attempts, 1);

        buffer.remove(&listed[0]).unwrap();
        assert!(buffer.entries().unwrap().is_empty());
    }

    #[test]
    fn copy_mode_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("primary");
        fs_err::write(&src, b"abc").unwrap();
        let buffer = BackLogBuffer::new(dir.path().join("back-log")).unwrap();
        let cause = ArchiveError::Catalog(CatalogError::transient("db down"));
        buffer
            .defer(&ArchiveRequest::push("obs.fits"), &validated(), &src, true, &cause)
            .unwrap();
        assert!(src.exists());
    }

    #[test]
    fn records_with_missing_data_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("staged");
        fs_err::write(&src, b"abc").unwrap();
        let buffer = BackLogBuffer::new(dir.path().join("back-log")).unwrap();
        let cause = ArchiveError::Catalog(CatalogError::transient("db down"));
        let entry = buffer
            .defer(&ArchiveRequest::push("obs.fits"), &validated(), &src, false, &cause)
            .unwrap();
        fs_err::remove_file(&entry.data_path).unwrap();
        assert!(buffer.entries().unwrap().is_empty());
    }

    #[test]
    fn entry_lock_is_obtainable() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("staged");
        fs_err::write(&src, b"abc").unwrap();
        let buffer = BackLogBuffer::new(dir.path().join("back-log")).unwrap();
        let cause = ArchiveError::Catalog(CatalogError::transient("db down"));
        let entry = buffer
            .defer(&ArchiveRequest::push("obs.fits"), &validated(), &src, false, &cause)
            .unwrap();
        let lock = buffer.try_lock(&entry).unwrap();
        assert!(lock.is_some());
    }
}
