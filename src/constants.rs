//! Layout and sizing constants shared across the crate.

/// Default read/write block size used when streaming request bodies.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Directory (relative to a disk mount point) holding per-request scratch files.
pub const STAGING_DIR: &str = "staging";
/// Directory (relative to a disk mount point) holding committed archive files.
pub const CONTENT_DIR: &str = "saf";

/// Prefix given to every file moved into the bad-files area.
pub const BAD_FILE_PREFIX: &str = "BAD-FILE";
/// Extension appended to a scratch file name for its request sidecar.
pub const REQUEST_SIDECAR_EXT: &str = "req.json";
/// Extension of back-log record files.
pub const BACKLOG_RECORD_EXT: &str = "backlog.json";
/// Current on-disk format version of back-log records.
pub const BACKLOG_RECORD_VERSION: u32 = 1;

pub const MEGABYTE: u64 = 1024 * 1024;

pub const DEFAULT_FREE_SPACE_FLOOR_MB: u64 = 64;
pub const DEFAULT_DISK_CHANGE_MB: u64 = 256;
pub const DEFAULT_SPACE_WARNING_MB: u64 = 1024;

pub const DEFAULT_CATALOG_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_CATALOG_RETRY_BACKOFF_MS: u64 = 250;

pub const DEFAULT_PULL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FORWARD_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_UNIT_STATUS_TTL_MS: u64 = 60_000;

/// Upper bound on storage-set re-selections when a disk completes mid-request.
pub const MAX_RESELECTIONS: usize = 1;
