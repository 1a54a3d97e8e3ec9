//! Per-file-id mutual exclusion.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};

use crate::error::{ArchiveError, Result};

/// Serializes version allocation and catalog updates for one file id at a time. Only ids
/// currently held are kept in memory.
#[derive(Debug, Default)]
pub struct VersionLocks {
    busy: Mutex<HashSet<String>>,
    released: Condvar,
}

#[derive(Debug)]
pub struct FileIdGuard<'a> {
    locks: &'a VersionLocks,
    file_id: String,
}

impl VersionLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, file_id: &str) -> Result<FileIdGuard<'_>> {
        let mut busy = self
            .busy
            .lock()
            .map_err(|err| ArchiveError::poisoned("file id", err))?;
        while busy.contains(file_id) {
            busy = self
                .released
                .wait(busy)
                .map_err(|err| ArchiveError::poisoned("file id", err))?;
        }
        busy.insert(file_id.to_string());
        Ok(FileIdGuard {
            locks: self,
            file_id: file_id.to_string(),
        })
    }
}

impl Drop for FileIdGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self
            .locks
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        busy.remove(&self.file_id);
        drop(busy);
        self.locks.released.notify_all();
    }
}
