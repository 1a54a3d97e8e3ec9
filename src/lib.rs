#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(clippy::useless_vec, clippy::uninlined_format_args)
)]
#![allow(clippy::module_name_repetitions)]
//
// Documentation lints: internal helpers are self-describing; public APIs still carry docs.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Sizes are byte counts of files on local disks; the casts stay far from their bounds.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
//
// The commit path is a sequence of guarded steps that reads best top to bottom.
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::similar_names)]
//
// Pattern matching: these pedantic lints often suggest changes that reduce clarity.
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::collapsible_match)]
//
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)] // Config structs naturally have many flags
#![allow(clippy::needless_continue)]
#![allow(clippy::case_sensitive_file_extension_comparisons)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::field_reassign_with_default)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::unused_self)]

//! Ingestion core of an archiving server.
//!
//! An [`Archiver`] accepts pushed or pulled files, stages them next to their target disk,
//! validates them with a mime-type specific [`ContentHandler`], and commits them to a
//! storage set of one primary and zero or more replica disks before recording them in the
//! [`Catalog`]. Failures after acceptance are either deferred to the back-log for replay or
//! quarantined in the bad-files area; nothing is ever silently dropped.

/// The archivist-core crate version (matches `Cargo.toml`).
pub const ARCHIVIST_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod archive;
pub mod backlog;
pub mod catalog;
pub mod checksum;
mod commit;
pub mod config;
pub mod constants;
pub mod error;
pub mod handler;
pub mod io;
mod locks;
pub mod notify;
pub mod proxy;
pub mod quarantine;
pub mod registry;
mod replication;
pub mod staging;
pub mod types;

pub use archive::{
    Archiver, ArchiverBuilder, DiscardReport, ReconcileReport, ReplayReport, VerifyReport,
    VerifyStatus,
};
pub use backlog::{BackLogBuffer, BackLogEntry, BackLogFailure, BackLogRecord};
pub use catalog::{Catalog, CatalogError, CatalogResult, MemoryCatalog, RetryPolicy};
pub use checksum::{Checksum, ChecksumEngine, ChecksumVariant, checksum_file, checksum_reader};
pub use commit::{CommitReport, content_path, storage_name};
pub use config::{
    ArchiveConfig, CapacityThresholds, DiskConfig, ProxyConfig, StreamConfig,
};
pub use error::{ArchiveError, ErrorCode, FailureClass, Result};
pub use handler::{
    ContentHandler, FitsHandler, HandlerError, HandlerInput, HandlerOutput, HandlerRegistry,
    PassthroughHandler,
};
pub use locks::{FileIdGuard, VersionLocks};
pub use notify::{LogNotifier, Notification, NotificationKind, Notifier, NotifyError};
#[cfg(feature = "http")]
pub use proxy::HttpUnitTransport;
pub use proxy::{
    ForwardBody, ForwardError, OfflineTransport, ProxyRouter, UnitStatus, UnitTransport,
};
pub use quarantine::{BadFilesArea, QuarantineTag, sweep_staging};
pub use registry::{DiskRegistry, WriteRecord};
pub use replication::{ReplicationFailure, ReplicationMonitor, pending_path, replica_entry};
pub use staging::StagingHandle;
pub use types::{
    ArchiveOutcome, ArchiveRequest, ArchiveSource, ArchiveStatus, ArchivingUnit, ChecksumChoice,
    Disk, DiskRole, DiskState, FileCatalogEntry, StagedFile, StorageSet, ValidatedFile,
    VersionRequest,
};
