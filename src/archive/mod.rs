//! The archiver handle.
//!
//! [`Archiver`] owns every shared component of the pipeline (disk registry, catalog handle,
//! content handlers, back-log, bad-files area, proxy router and replication worker). It is
//! `Send + Sync`; share it behind an `Arc` and call it from one worker per request.

mod maintenance;
mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;

use crate::backlog::BackLogBuffer;
use crate::catalog::{Catalog, MemoryCatalog};
use crate::commit::CommitCoordinator;
use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::locks::VersionLocks;
use crate::notify::{LogNotifier, Notifier};
use crate::proxy::{ProxyRouter, UnitTransport};
use crate::quarantine::{BadFilesArea, sweep_staging};
use crate::registry::DiskRegistry;
use crate::replication::{ReplicationMonitor, ReplicationQueue, ReplicationShared};

pub use maintenance::{
    DiscardReport, ReconcileReport, ReplayReport, VerifyReport, VerifyStatus,
};

pub struct Archiver {
    config: ArchiveConfig,
    registry: Arc<DiskRegistry>,
    catalog: Arc<dyn Catalog>,
    handlers: HandlerRegistry,
    backlog: BackLogBuffer,
    bad_files: BadFilesArea,
    proxy: ProxyRouter,
    committer: CommitCoordinator,
    recovered: Vec<PathBuf>,
}

impl std::fmt::Debug for Archiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archiver")
            .field("host_id", &self.config.host_id)
            .field("registry", &self.registry)
            .field("handlers", &self.handlers)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

/// Collaborators for [`Archiver::open`]; each defaults to the in-process implementation.
pub struct ArchiverBuilder {
    config: ArchiveConfig,
    catalog: Option<Arc<dyn Catalog>>,
    handlers: Option<HandlerRegistry>,
    notifier: Option<Arc<dyn Notifier>>,
    transport: Option<Arc<dyn UnitTransport>>,
}

impl ArchiverBuilder {
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    #[must_use]
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn UnitTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Prepare the storage areas, load disk state, quarantine leftovers of a previous
    /// process and start the replication worker.
    pub fn open(self) -> Result<Archiver> {
        let config = self.config;
        config.validate()?;
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(MemoryCatalog::new()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let transport = self.transport.unwrap_or_else(default_transport);

        for set in &config.storage_sets {
            for disk_id in set.disk_ids() {
                if let Some(disk) = config.disk(disk_id) {
                    fs_err::create_dir_all(disk.mount_path.join(crate::constants::STAGING_DIR))?;
                    fs_err::create_dir_all(disk.mount_path.join(crate::constants::CONTENT_DIR))?;
                }
            }
        }
        let backlog = BackLogBuffer::new(&config.back_log_area)?;
        let bad_files = BadFilesArea::new(&config.bad_files_area)?;
        let registry = Arc::new(DiskRegistry::new(
            &config,
            Arc::clone(&catalog),
            Arc::clone(&notifier),
        )?);

        let mut recovered = Vec::new();
        for disk in registry.disks() {
            recovered.extend(sweep_staging(&disk.staging_dir(), &bad_files)?);
        }

        let shared = Arc::new(ReplicationShared {
            registry: Arc::clone(&registry),
            catalog: Arc::clone(&catalog),
            retry: config.catalog_retry,
            locks: Arc::new(VersionLocks::new()),
            notifier,
            monitor: Arc::new(ReplicationMonitor::new()),
        });
        let queue = ReplicationQueue::spawn(Arc::clone(&shared))?;
        let proxy = ProxyRouter::new(&config, transport);
        let committer = CommitCoordinator {
            shared,
            queue,
            host_id: config.host_id.clone(),
        };

        tracing::info!(
            target = "archivist::archive",
            host_id = %config.host_id,
            disks = registry.disks().count(),
            storage_sets = registry.storage_sets().len(),
            proxy_only = !registry.is_eligible_locally(),
            recovered = recovered.len(),
            back_log_buffering = config.back_log_buffering,
            "archiver opened"
        );

        Ok(Archiver {
            config,
            registry,
            catalog,
            handlers: self.handlers.unwrap_or_else(HandlerRegistry::with_defaults),
            backlog,
            bad_files,
            proxy,
            committer,
            recovered,
        })
    }
}

#[cfg(feature = "http")]
fn default_transport() -> Arc<dyn UnitTransport> {
    Arc::new(crate::proxy::HttpUnitTransport::new())
}

#[cfg(not(feature = "http"))]
fn default_transport() -> Arc<dyn UnitTransport> {
    Arc::new(crate::proxy::OfflineTransport)
}

impl Archiver {
    #[must_use]
    pub fn builder(config: ArchiveConfig) -> ArchiverBuilder {
        ArchiverBuilder {
            config,
            catalog: None,
            handlers: None,
            notifier: None,
            transport: None,
        }
    }

    /// Open with in-process collaborators only.
    pub fn open(config: ArchiveConfig) -> Result<Self> {
        Self::builder(config).open()
    }

    #[must_use]
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.config.host_id
    }

    #[must_use]
    pub fn registry(&self) -> &DiskRegistry {
        &self.registry
    }

    #[must_use]
    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    #[must_use]
    pub fn backlog(&self) -> &BackLogBuffer {
        &self.backlog
    }

    #[must_use]
    pub fn bad_files(&self) -> &BadFilesArea {
        &self.bad_files
    }

    #[must_use]
    pub fn proxy(&self) -> &ProxyRouter {
        &self.proxy
    }

    /// Files quarantined by the startup sweep.
    #[must_use]
    pub fn recovered_at_startup(&self) -> &[PathBuf] {
        &self.recovered
    }
}
