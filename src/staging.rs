//! Per-request scratch files.
//!
//! A [`StagingHandle`] owns a scratch file and its request sidecar in the staging area of the
//! target primary disk, so the later commit is a same-device rename. Until [`finalize`]
//! succeeds, dropping the handle removes both files.
//!
//! [`finalize`]: StagingHandle::finalize

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::checksum::{ChecksumEngine, ChecksumVariant};
use crate::constants::REQUEST_SIDECAR_EXT;
use crate::error::{ArchiveError, Result};
use crate::io::{remove_if_exists, write_json_atomic};
use crate::types::{ArchiveRequest, Disk, StagedFile};

/// Sidecar path for a scratch or quarantined file.
#[must_use]
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(REQUEST_SIDECAR_EXT);
    path.with_file_name(name)
}

/// Whether `path` names a request sidecar.
#[must_use]
pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(&format!(".{REQUEST_SIDECAR_EXT}")))
}

pub struct StagingHandle {
    path: PathBuf,
    sidecar: PathBuf,
    disk_id: String,
    filename: String,
    file: Option<fs_err::File>,
    engine: Option<ChecksumEngine>,
    size: u64,
    max_size: Option<u64>,
    finished: bool,
}

impl std::fmt::Debug for StagingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingHandle")
            .field("path", &self.path)
            .field("disk_id", &self.disk_id)
            .field("size", &self.size)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl StagingHandle {
    /// Create the scratch file and its sidecar under `disk`'s staging area.
    pub fn begin(
        request: &ArchiveRequest,
        disk: &Disk,
        checksum: Option<ChecksumVariant>,
        max_size: Option<u64>,
    ) -> Result<Self> {
        let dir = disk.staging_dir();
        fs_err::create_dir_all(&dir)?;
        let path = dir.join(request.scratch_name());
        let sidecar = sidecar_path(&path);
        let mut handle = Self {
            path,
            sidecar,
            disk_id: disk.disk_id.clone(),
            filename: request.filename.clone(),
            file: None,
            engine: checksum.map(ChecksumEngine::new),
            size: 0,
            max_size,
            finished: false,
        };
        write_json_atomic(&handle.sidecar, request)?;
        handle.file = Some(
            fs_err::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&handle.path)?,
        );
        tracing::debug!(
            target = "archivist::staging",
            request_id = %request.request_id,
            path = %handle.path.display(),
            "staging started"
        );
        Ok(handle)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write(&mut self, buffer: &[u8]) -> Result<()> {
        if let Some(limit) = self.max_size {
            if self.size + buffer.len() as u64 > limit {
                return Err(ArchiveError::QuotaExceeded { limit });
            }
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ArchiveError::InvalidRequest("staging already finished".into()))?;
        file.write_all(buffer)?;
        if let Some(engine) = self.engine.as_mut() {
            engine.update(buffer);
        }
        self.size += buffer.len() as u64;
        Ok(())
    }

    /// Stream `reader` into the scratch file in `block_size` chunks. Read failures are mapped
    /// through `on_read_error`, since what they mean depends on where the bytes come from.
    pub fn copy_from(
        &mut self,
        reader: &mut dyn Read,
        block_size: usize,
        on_read_error: impl Fn(io::Error) -> ArchiveError,
    ) -> Result<u64> {
        let mut buf = vec![0u8; block_size.max(1)];
        let mut copied = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(on_read_error(err)),
            };
            self.write(&buf[..n])?;
            copied += n as u64;
        }
        Ok(copied)
    }

    /// Close the scratch file. An empty file is rejected and removed.
    pub fn finalize(mut self) -> Result<StagedFile> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        if self.size == 0 {
            self.cleanup();
            return Err(ArchiveError::ZeroLengthFile {
                filename: self.filename.clone(),
            });
        }
        self.finished = true;
        Ok(StagedFile {
            path: self.path.clone(),
            sidecar: self.sidecar.clone(),
            disk_id: self.disk_id.clone(),
            size: self.size,
            checksum: self.engine.take().map(ChecksumEngine::finalize),
        })
    }

    /// Abandon the request and remove every staging artifact.
    pub fn abort(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        self.file = None;
        self.finished = true;
        for path in [&self.path, &self.sidecar] {
            if let Err(err) = remove_if_exists(path) {
                tracing::warn!(
                    target = "archivist::staging",
                    path = %path.display(),
                    error = %err,
                    "failed to remove staging artifact"
                );
            }
        }
    }
}

impl Drop for StagingHandle {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                target = "archivist::staging",
                path = %self.path.display(),
                "staging abandoned; cleaning up"
            );
            self.cleanup();
        }
    }
}

/// Remove a staged file and its sidecar after it reached a disposition elsewhere.
pub(crate) fn discard_staged(staged: &StagedFile) {
    for path in [&staged.path, &staged.sidecar] {
        if let Err(err) = remove_if_exists(path) {
            tracing::warn!(
                target = "archivist::staging",
                path = %path.display(),
                error = %err,
                "failed to remove staged file"
            );
        }
    }
}
