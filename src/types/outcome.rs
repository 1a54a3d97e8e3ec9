//! Caller-visible results.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::Checksum;
use crate::error::{ArchiveError, ErrorCode};

/// The three response outcomes of an archive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveStatus {
    /// Catalog updated.
    Success,
    /// Accepted and deferred to the back-log.
    Buffered,
    /// Terminal failure.
    Failure,
}

/// Reply for one archive request, also the wire format exchanged with archiving units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    pub request_id: Uuid,
    pub status: ArchiveStatus,
    #[serde(default)]
    pub code: Option<ErrorCode>,
    pub message: String,
    /// Host that holds (or buffered) the file.
    pub host_id: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub disk_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

impl ArchiveOutcome {
    #[must_use]
    pub fn success(
        request_id: Uuid,
        host_id: &str,
        file_id: &str,
        version: u32,
        disk_id: &str,
        size: u64,
        checksum: Option<Checksum>,
    ) -> Self {
        Self {
            request_id,
            status: ArchiveStatus::Success,
            code: None,
            message: format!("Successfully archived {file_id} (version {version}) on {disk_id}"),
            host_id: host_id.to_string(),
            file_id: Some(file_id.to_string()),
            version: Some(version),
            disk_id: Some(disk_id.to_string()),
            size: Some(size),
            checksum,
        }
    }

    #[must_use]
    pub fn buffered(
        request_id: Uuid,
        host_id: &str,
        file_id: &str,
        cause: &ArchiveError,
    ) -> Self {
        Self {
            request_id,
            status: ArchiveStatus::Buffered,
            code: Some(cause.code()),
            message: format!("{file_id} was back-log buffered and will be retried: {cause}"),
            host_id: host_id.to_string(),
            file_id: Some(file_id.to_string()),
            version: None,
            disk_id: None,
            size: None,
            checksum: None,
        }
    }

    #[must_use]
    pub fn failure(request_id: Uuid, host_id: &str, error: &ArchiveError) -> Self {
        Self {
            request_id,
            status: ArchiveStatus::Failure,
            code: Some(error.code()),
            message: error.to_string(),
            host_id: host_id.to_string(),
            file_id: None,
            version: None,
            disk_id: None,
            size: None,
            checksum: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ArchiveStatus::Success
    }
}
