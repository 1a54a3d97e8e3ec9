//! File moves, copies and record writes used by every storage area.

use std::io::{self, Write};
use std::path::Path;

use atomic_write_file::AtomicWriteFile;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs_err::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Move a file, replacing `to`. Falls back to copy and remove when a rename is impossible
/// (typically across devices).
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    ensure_parent(to)?;
    match fs_err::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if from.exists() => {
            tracing::debug!(
                target = "archivist::io",
                from = %from.display(),
                to = %to.display(),
                error = %err,
                "rename failed; copying instead"
            );
            copy_file(from, to)?;
            fs_err::remove_file(from)
        }
        Err(err) => Err(err),
    }
}

/// Copy a file so that `to` is either absent or complete: the bytes go to a temporary file
/// in the destination directory, are synced, then renamed into place.
pub fn copy_file(from: &Path, to: &Path) -> io::Result<u64> {
    ensure_parent(to)?;
    let dir = to.parent().unwrap_or_else(|| Path::new("."));
    let mut source = fs_err::File::open(from)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let copied = io::copy(&mut source, tmp.as_file_mut())?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(to).map_err(|err| err.error)?;
    Ok(copied)
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Write a JSON record so that readers see either the old or the new content.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let mut file = AtomicWriteFile::open(path)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.flush()?;
    file.commit()?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs_err::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}
