//! Public types exposed by the `archivist-core` crate.

pub mod catalog;
pub mod disk;
pub mod outcome;
pub mod request;
pub mod unit;

pub use catalog::FileCatalogEntry;
pub use disk::{Disk, DiskRole, DiskState, StorageSet};
pub use outcome::{ArchiveOutcome, ArchiveStatus};
pub use request::{
    ArchiveRequest, ArchiveSource, ChecksumChoice, StagedFile, ValidatedFile, VersionRequest,
};
pub use unit::ArchivingUnit;
