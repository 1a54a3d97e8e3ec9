//! Bad-files area and crash-recovery sweep.
//!
//! Quarantined files are renamed `BAD-FILE-<TAG>-<name>`; a request sidecar travels with its
//! file and keeps the same name plus the sidecar extension.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::constants::BAD_FILE_PREFIX;
use crate::error::Result;
use crate::io::{copy_file, move_file, remove_if_exists, write_json_atomic};
use crate::staging::{is_sidecar, sidecar_path};
use crate::types::ArchiveRequest;

/// Why a file was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineTag {
    /// Rejected by the content handler.
    Validation,
    /// Terminal failure after validation, or a retryable one with the back-log disabled.
    Unretryable,
    /// Left in a staging area by a previous process.
    Crash,
    /// Requested by an operator or maintenance sweep.
    Manual,
}

impl QuarantineTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Unretryable => "UNRETRYABLE",
            Self::Crash => "CRASH",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for QuarantineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BadFilesArea {
    dir: PathBuf,
}

impl BadFilesArea {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claim a free target name by creating it empty. The caller replaces the placeholder.
    fn reserve_target(&self, name: &str, tag: QuarantineTag) -> Result<PathBuf> {
        let mut counter = 0u32;
        loop {
            let candidate = if counter == 0 {
                self.dir.join(format!("{BAD_FILE_PREFIX}-{tag}-{name}"))
            } else {
                self.dir
                    .join(format!("{BAD_FILE_PREFIX}-{tag}-{counter}-{name}"))
            };
            match fs_err::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(_) => return Ok(candidate),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => counter += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn release_target(target: &Path) {
        if let Err(err) = remove_if_exists(target) {
            tracing::warn!(
                target = "archivist::quarantine",
                path = %target.display(),
                error = %err,
                "failed to remove quarantine placeholder"
            );
        }
    }

    /// Move `path` (and its sidecar, if present) into the bad-files area.
    pub fn quarantine(&self, path: &Path, tag: QuarantineTag) -> Result<PathBuf> {
        self.quarantine_with_sidecar(path, &sidecar_path(path), tag)
    }

    /// Move `path` into the bad-files area, pairing it with an explicitly located sidecar.
    pub fn quarantine_with_sidecar(
        &self,
        path: &Path,
        sidecar: &Path,
        tag: QuarantineTag,
    ) -> Result<PathBuf> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed");
        let target = self.reserve_target(name, tag)?;
        if let Err(err) = move_file(path, &target) {
            Self::release_target(&target);
            return Err(err.into());
        }
        if sidecar.exists() {
            move_file(sidecar, &sidecar_path(&target))?;
        }
        tracing::debug!(
            target = "archivist::quarantine",
            from = %path.display(),
            to = %target.display(),
            tag = %tag,
            "file quarantined"
        );
        Ok(target)
    }

    /// Copy `source` into the bad-files area under `name`, writing the request as its sidecar.
    /// Used once the bytes are already committed to a primary disk and must stay there.
    pub fn quarantine_copy(
        &self,
        source: &Path,
        name: &str,
        request: &ArchiveRequest,
        tag: QuarantineTag,
    ) -> Result<PathBuf> {
        let target = self.reserve_target(name, tag)?;
        if let Err(err) = copy_file(source, &target) {
            Self::release_target(&target);
            return Err(err.into());
        }
        write_json_atomic(&sidecar_path(&target), request)?;
        tracing::debug!(
            target = "archivist::quarantine",
            from = %source.display(),
            to = %target.display(),
            tag = %tag,
            "committed bytes copied to quarantine"
        );
        Ok(target)
    }

    /// Quarantined data files, sidecars excluded.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs_err::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && !is_sidecar(&path) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Quarantine every leftover scratch file in a staging directory. Sidecars without a data
/// file are moved too. Returns the quarantined data files.
pub fn sweep_staging(staging_dir: &Path, area: &BadFilesArea) -> Result<Vec<PathBuf>> {
    if !staging_dir.exists() {
        return Ok(Vec::new());
    }
    let mut data = Vec::new();
    let mut sidecars = Vec::new();
    for entry in fs_err::read_dir(staging_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if is_sidecar(&path) {
            sidecars.push(path);
        } else {
            data.push(path);
        }
    }
    data.sort();
    let mut quarantined = Vec::with_capacity(data.len());
    for path in data {
        quarantined.push(area.quarantine(&path, QuarantineTag::Crash)?);
    }
    for sidecar in sidecars.into_iter().filter(|p| p.exists()) {
        area.quarantine_with_sidecar(&sidecar, Path::new(""), QuarantineTag::Crash)?;
    }
    if !quarantined.is_empty() {
        tracing::warn!(
            target = "archivist::quarantine",
            staging = %staging_dir.display(),
            count = quarantined.len(),
            "recovered leftover staging files"
        );
    }
    Ok(quarantined)
}
