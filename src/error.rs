//! Error taxonomy for the ingestion pipeline.
//!
//! Every failure is classified once, through [`ArchiveError::class`], and the class alone
//! decides whether staged bytes are quarantined, deferred to the back-log, or the request
//! simply fails.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogError;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Content-Length is 0 for {filename}")]
    ZeroLengthFile { filename: String },

    #[error("unknown mime-type: {mime_type}")]
    UnknownMimeType { mime_type: String },

    #[error("no free storage set for mime-type {mime_type}")]
    NoFreeStorageSet { mime_type: String },

    #[error("disk {disk_id} is completed; no further writes accepted")]
    DiskCompleted { disk_id: String },

    #[error("staged size exceeds the configured limit of {limit} bytes")]
    QuotaExceeded { limit: u64 },

    #[error("bad file {filename}: {reason}")]
    BadFile { filename: String, reason: String },

    #[error("content handler {handler} does not support mime-type {mime_type}")]
    UnsupportedMimeType { handler: String, mime_type: String },

    #[error("no content handler available for mime-type {mime_type}: {reason}")]
    HandlerUnavailable { mime_type: String, reason: String },

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("write to primary disk {disk_id} failed: {source}")]
    PrimaryWrite {
        disk_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write to replica disk {disk_id} failed: {source}")]
    ReplicaWrite {
        disk_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} on disk {disk_id} holds bytes no catalog row of this file version owns")]
    PathOccupied { disk_id: String, path: PathBuf },

    #[error("pull from {url} failed: {reason}")]
    Pull {
        url: String,
        reason: String,
        retryable: bool,
    },

    #[error("client aborted the upload: {reason}")]
    Cancelled { reason: String },

    #[error("all {tried} archiving units failed; last error: {last_error}")]
    ProxyExhausted { tried: usize, last_error: String },

    #[error("back-log record {path:?} is unusable: {reason}")]
    BackLogRecord { path: PathBuf, reason: String },

    #[error("file {file_id} version {version} not found")]
    FileNotFound { file_id: String, version: u32 },

    #[error("remove requests are not allowed by configuration")]
    RemoveNotAllowed,

    #[error("lock poisoned: {0}")]
    Lock(String),
}

/// How a failure is disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Quarantine staged bytes (if any) and fail.
    Terminal,
    /// Defer to the back-log when enabled, otherwise quarantine and fail.
    Retryable,
    /// Terminal, but also implies disk-completion bookkeeping.
    CapacityExhausted,
    /// The request was abandoned before validation; no side effects allowed.
    Cancelled,
}

/// Machine-readable error codes surfaced in `FAILURE` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ZeroLengthFile,
    UnknownMimeType,
    InvalidRequest,
    BadFile,
    UnsupportedMimeType,
    HandlerUnavailable,
    NoFreeStorageSet,
    DiskCompleted,
    QuotaExceeded,
    CatalogUnavailable,
    CatalogRejected,
    PrimaryWrite,
    ReplicaWrite,
    PathOccupied,
    PullFailed,
    Cancelled,
    ProxyExhausted,
    FileNotFound,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZeroLengthFile => "ZERO_LENGTH_FILE",
            Self::UnknownMimeType => "UNKNOWN_MIME_TYPE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::BadFile => "BAD_FILE",
            Self::UnsupportedMimeType => "UNSUPPORTED_MIME_TYPE",
            Self::HandlerUnavailable => "HANDLER_UNAVAILABLE",
            Self::NoFreeStorageSet => "NO_FREE_STORAGE_SET",
            Self::DiskCompleted => "DISK_COMPLETED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::CatalogUnavailable => "CATALOG_UNAVAILABLE",
            Self::CatalogRejected => "CATALOG_REJECTED",
            Self::PrimaryWrite => "PRIMARY_WRITE",
            Self::ReplicaWrite => "REPLICA_WRITE",
            Self::PathOccupied => "PATH_OCCUPIED",
            Self::PullFailed => "PULL_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::ProxyExhausted => "PROXY_EXHAUSTED",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ArchiveError {
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Catalog(err) if err.retryable => FailureClass::Retryable,
            Self::Pull { retryable: true, .. } => FailureClass::Retryable,
            Self::Io(_)
            | Self::PrimaryWrite { .. }
            | Self::ReplicaWrite { .. }
            | Self::DiskCompleted { .. } => FailureClass::Retryable,
            Self::NoFreeStorageSet { .. } | Self::QuotaExceeded { .. } => {
                FailureClass::CapacityExhausted
            }
            Self::Cancelled { .. } => FailureClass::Cancelled,
            _ => FailureClass::Terminal,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ZeroLengthFile { .. } => ErrorCode::ZeroLengthFile,
            Self::UnknownMimeType { .. } => ErrorCode::UnknownMimeType,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::BadFile { .. } => ErrorCode::BadFile,
            Self::UnsupportedMimeType { .. } => ErrorCode::UnsupportedMimeType,
            Self::HandlerUnavailable { .. } => ErrorCode::HandlerUnavailable,
            Self::NoFreeStorageSet { .. } => ErrorCode::NoFreeStorageSet,
            Self::DiskCompleted { .. } => ErrorCode::DiskCompleted,
            Self::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            Self::Catalog(err) if err.retryable => ErrorCode::CatalogUnavailable,
            Self::Catalog(_) => ErrorCode::CatalogRejected,
            Self::PrimaryWrite { .. } => ErrorCode::PrimaryWrite,
            Self::ReplicaWrite { .. } => ErrorCode::ReplicaWrite,
            Self::PathOccupied { .. } => ErrorCode::PathOccupied,
            Self::Pull { .. } => ErrorCode::PullFailed,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::ProxyExhausted { .. } => ErrorCode::ProxyExhausted,
            Self::FileNotFound { .. } => ErrorCode::FileNotFound,
            Self::Io(_)
            | Self::Serde(_)
            | Self::Config(_)
            | Self::BackLogRecord { .. }
            | Self::RemoveNotAllowed
            | Self::Lock(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn poisoned<T>(what: &str, _err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(format!("{what} lock poisoned"))
    }
}
