//! Request pipeline.
//!
//! A request is routed (locally or through the proxy), staged on the primary disk of the
//! selected storage set, validated by its content handler and committed. Once a request is
//! accepted, its bytes end in exactly one place: the archive, the back-log or the bad-files
//! area.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::checksum::{ChecksumVariant, checksum_file};
use crate::commit::{CommitFailure, CommitReport};
use crate::constants::MAX_RESELECTIONS;
use crate::error::{ArchiveError, FailureClass, Result};
use crate::handler::HandlerInput;
use crate::io::{open_locator, remove_if_exists};
use crate::proxy::ForwardBody;
use crate::quarantine::QuarantineTag;
use crate::staging::StagingHandle;
use crate::types::{
    ArchiveOutcome, ArchiveRequest, ArchiveSource, ChecksumChoice, StagedFile, StorageSet,
    ValidatedFile,
};

use super::Archiver;

/// Bytes ready for commit, with where they live.
struct Validated {
    file: ValidatedFile,
    path: PathBuf,
}

impl Archiver {
    /// Archive a request whose bytes are read from `body`. Pull requests ignore `body`.
    #[instrument(
        target = "archivist::archive",
        skip_all,
        fields(request_id = %request.request_id, filename = %request.filename)
    )]
    pub fn archive(&self, request: &ArchiveRequest, body: &mut dyn Read) -> ArchiveOutcome {
        if matches!(request.source, ArchiveSource::Pull { .. }) {
            return self.pull(request);
        }
        let mime_type = match self.resolve_mime_type(request) {
            Ok(mime_type) => mime_type,
            Err(err) => return self.reject(request, &err),
        };
        if self.should_proxy(&mime_type) {
            self.proxy_push(request, &mime_type, body)
        } else {
            self.archive_local(request, &mime_type, body)
        }
    }

    /// Archive a request the server fetches from its `file:` or `http(s):` locator.
    #[instrument(
        target = "archivist::archive",
        skip_all,
        fields(request_id = %request.request_id, filename = %request.filename)
    )]
    pub fn archive_url(&self, request: &ArchiveRequest) -> ArchiveOutcome {
        if !matches!(request.source, ArchiveSource::Pull { .. }) {
            return self.reject(
                request,
                &ArchiveError::InvalidRequest("push request without a body".into()),
            );
        }
        self.pull(request)
    }

    fn pull(&self, request: &ArchiveRequest) -> ArchiveOutcome {
        let mime_type = match self.resolve_mime_type(request) {
            Ok(mime_type) => mime_type,
            Err(err) => return self.reject(request, &err),
        };
        if !self.should_proxy(&mime_type) {
            return self.pull_local(request, &mime_type);
        }
        let local = |req: &ArchiveRequest, _: ForwardBody<'_>| self.pull_local(req, &mime_type);
        match self
            .proxy
            .route(request, &mime_type, ForwardBody::None, &local)
        {
            Ok(outcome) => outcome,
            Err(err) => self.reject(request, &err),
        }
    }

    fn pull_local(&self, request: &ArchiveRequest, mime_type: &str) -> ArchiveOutcome {
        let ArchiveSource::Pull { url } = &request.source else {
            return self.reject(
                request,
                &ArchiveError::InvalidRequest("pull request without a locator".into()),
            );
        };
        match open_locator(url, self.config.pull_timeout()) {
            Ok(mut source) => {
                let expected = source.content_length;
                self.ingest(request, mime_type, source.reader.as_mut(), expected)
            }
            Err(err) => self.reject(request, &err),
        }
    }

    fn archive_local(
        &self,
        request: &ArchiveRequest,
        mime_type: &str,
        body: &mut dyn Read,
    ) -> ArchiveOutcome {
        let expected = match request.source {
            ArchiveSource::Push { content_length } => content_length,
            ArchiveSource::Pull { .. } => None,
        };
        self.ingest(request, mime_type, body, expected)
    }

    /// Stage, validate and commit. Everything before a finalized staged file leaves no trace.
    fn ingest(
        &self,
        request: &ArchiveRequest,
        mime_type: &str,
        reader: &mut dyn Read,
        expected_len: Option<u64>,
    ) -> ArchiveOutcome {
        let (staged, set) = match self.stage(request, mime_type, reader, expected_len) {
            Ok(staged) => staged,
            Err(err) => return self.reject(request, &err),
        };
        let validated = match self.validate(request, mime_type, &staged) {
            Ok(validated) => validated,
            Err((err, bytes)) => {
                let tag = quarantine_tag(&err);
                return self.quarantine_failed(request, &bytes, false, &staged.sidecar, &err, tag);
            }
        };
        match self.commit_with_reselect(request, &validated.file, &validated.path, mime_type, set)
        {
            Ok(report) => {
                drop_sidecar(&staged.sidecar);
                self.committed(request, &report)
            }
            Err(failure) => self.dispose(request, &validated, failure, &staged.sidecar),
        }
    }

    fn stage(
        &self,
        request: &ArchiveRequest,
        mime_type: &str,
        reader: &mut dyn Read,
        expected_len: Option<u64>,
    ) -> Result<(StagedFile, StorageSet)> {
        let set = self.registry.select_target_set(mime_type)?;
        let disk = self
            .registry
            .disk(&set.primary)
            .ok_or_else(|| ArchiveError::Config(format!("unknown disk {}", set.primary)))?;
        let variant = match request.checksum {
            ChecksumChoice::Default => Some(self.config.checksum),
            ChecksumChoice::Variant(variant) => Some(variant),
            ChecksumChoice::Disabled => None,
        };
        let mut handle = StagingHandle::begin(request, disk, variant, self.config.max_file_size)?;
        match &request.source {
            ArchiveSource::Push { .. } => {
                handle.copy_from(reader, self.config.block_size, |err| {
                    ArchiveError::Cancelled {
                        reason: err.to_string(),
                    }
                })?;
                if let Some(expected) = expected_len.filter(|n| *n != handle.size()) {
                    return Err(ArchiveError::Cancelled {
                        reason: format!("received {} of {expected} bytes", handle.size()),
                    });
                }
            }
            ArchiveSource::Pull { url } => {
                handle.copy_from(reader, self.config.block_size, |err| ArchiveError::Pull {
                    url: url.clone(),
                    reason: err.to_string(),
                    retryable: true,
                })?;
                if let Some(expected) = expected_len.filter(|n| *n != handle.size()) {
                    return Err(ArchiveError::Pull {
                        url: url.clone(),
                        reason: format!("received {} of {expected} bytes", handle.size()),
                        retryable: true,
                    });
                }
            }
        }
        let staged = handle.finalize()?;
        tracing::debug!(
            target = "archivist::archive",
            request_id = %request.request_id,
            size = staged.size,
            disk_id = %staged.disk_id,
            "request staged"
        );
        Ok((staged, set))
    }

    /// Run the content handler. On failure, returns the path of the bytes to quarantine.
    fn validate(
        &self,
        request: &ArchiveRequest,
        mime_type: &str,
        staged: &StagedFile,
    ) -> std::result::Result<Validated, (ArchiveError, PathBuf)> {
        let file_id = request.effective_file_id();
        let handler = self
            .handlers
            .resolve(mime_type)
            .map_err(|err| (err, staged.path.clone()))?;
        let input = HandlerInput {
            staged_path: &staged.path,
            mime_type,
            file_id: &file_id,
            params: &request.handler_params,
        };
        let output = handler.handle(&input).map_err(|err| {
            (
                err.into_archive_error(handler.name(), &request.filename, mime_type),
                staged.path.clone(),
            )
        })?;

        let moved = output.final_path != staged.path;
        let (size, checksum) = if output.rewritten || moved {
            let variant: Option<ChecksumVariant> = staged.checksum.as_ref().map(|c| c.variant);
            let size = fs_err::metadata(&output.final_path)
                .map_err(|err| (ArchiveError::from(err), output.final_path.clone()))?
                .len();
            let checksum = variant
                .map(|variant| checksum_file(&output.final_path, variant))
                .transpose()
                .map_err(|err| (err, output.final_path.clone()))?;
            (size, checksum)
        } else {
            (staged.size, staged.checksum.clone())
        };
        if moved {
            if let Err(err) = remove_if_exists(&staged.path) {
                tracing::warn!(
                    target = "archivist::archive",
                    path = %staged.path.display(),
                    error = %err,
                    "failed to remove superseded staged file"
                );
            }
        }
        Ok(Validated {
            file: ValidatedFile {
                file_id: output.file_id.unwrap_or(file_id),
                mime_type: output.final_mime_type,
                size,
                checksum,
                metadata: output.metadata,
            },
            path: output.final_path,
        })
    }

    /// Commit, re-selecting the storage set once when one of its disks completes underneath
    /// the request.
    pub(super) fn commit_with_reselect(
        &self,
        request: &ArchiveRequest,
        validated: &ValidatedFile,
        source: &Path,
        routing_mime: &str,
        set: StorageSet,
    ) -> std::result::Result<CommitReport, CommitFailure> {
        let mut set = set;
        let mut reselections = 0;
        loop {
            match self.committer.commit(request, validated, source, &set) {
                Err(CommitFailure {
                    error: ArchiveError::DiskCompleted { disk_id },
                    primary_copy: None,
                }) if reselections < MAX_RESELECTIONS => {
                    reselections += 1;
                    tracing::debug!(
                        target = "archivist::archive",
                        request_id = %request.request_id,
                        disk_id = %disk_id,
                        "storage set disk completed; re-selecting storage set"
                    );
                    set = self
                        .registry
                        .select_target_set(routing_mime)
                        .map_err(|error| CommitFailure {
                            error,
                            primary_copy: None,
                        })?;
                }
                other => return other,
            }
        }
    }

    /// Back-log a retryable failure, quarantine anything else.
    fn dispose(
        &self,
        request: &ArchiveRequest,
        validated: &Validated,
        failure: CommitFailure,
        sidecar: &Path,
    ) -> ArchiveOutcome {
        let CommitFailure {
            error,
            primary_copy,
        } = failure;
        let (bytes, keep) = match &primary_copy {
            Some(path) => (path.as_path(), true),
            None => (validated.path.as_path(), false),
        };
        if error.class() == FailureClass::Retryable && self.config.back_log_buffering {
            match self
                .backlog
                .defer(request, &validated.file, bytes, keep, &error)
            {
                Ok(entry) => {
                    drop_sidecar(sidecar);
                    tracing::warn!(
                        target = "archivist::archive",
                        request_id = %request.request_id,
                        file_id = %validated.file.file_id,
                        disposition = "buffered",
                        code = %error.code(),
                        error = %error,
                        entry = %entry.record_path.display(),
                        "request buffered"
                    );
                    return ArchiveOutcome::buffered(
                        request.request_id,
                        self.host_id(),
                        &validated.file.file_id,
                        &error,
                    );
                }
                Err(defer_err) => tracing::error!(
                    target = "archivist::archive",
                    request_id = %request.request_id,
                    error = %defer_err,
                    "back-log write failed; quarantining instead"
                ),
            }
        }
        self.quarantine_failed(request, bytes, keep, sidecar, &error, quarantine_tag(&error))
    }

    /// Move (or, for committed primary bytes, copy) a failed request into the bad-files area.
    fn quarantine_failed(
        &self,
        request: &ArchiveRequest,
        bytes: &Path,
        keep: bool,
        sidecar: &Path,
        error: &ArchiveError,
        tag: QuarantineTag,
    ) -> ArchiveOutcome {
        let quarantined = if keep {
            self.bad_files
                .quarantine_copy(bytes, &request.scratch_name(), request, tag)
                .inspect(|_| drop_sidecar(sidecar))
        } else {
            self.bad_files.quarantine_with_sidecar(bytes, sidecar, tag)
        };
        match quarantined {
            Ok(path) => tracing::warn!(
                target = "archivist::archive",
                request_id = %request.request_id,
                file_id = %request.effective_file_id(),
                disposition = "quarantined",
                tag = %tag,
                code = %error.code(),
                error = %error,
                path = %path.display(),
                "request failed"
            ),
            Err(err) => tracing::error!(
                target = "archivist::archive",
                request_id = %request.request_id,
                file_id = %request.effective_file_id(),
                disposition = "stranded",
                code = %error.code(),
                error = %error,
                quarantine_error = %err,
                "request failed and could not be quarantined; left for the staging sweep"
            ),
        }
        ArchiveOutcome::failure(request.request_id, self.host_id(), error)
    }

    fn committed(&self, request: &ArchiveRequest, report: &CommitReport) -> ArchiveOutcome {
        let entry = &report.entry;
        tracing::info!(
            target = "archivist::archive",
            request_id = %request.request_id,
            file_id = %entry.file_id,
            version = entry.version,
            disk_id = %entry.disk_id,
            size = entry.size,
            replicas = report.replicas.len(),
            queued_replicas = report.queued_replicas.len(),
            disposition = "committed",
            "request archived"
        );
        ArchiveOutcome::success(
            request.request_id,
            self.host_id(),
            &entry.file_id,
            entry.version,
            &entry.disk_id,
            entry.size,
            entry.stored_checksum(),
        )
    }

    /// Failure before acceptance: nothing was written.
    fn reject(&self, request: &ArchiveRequest, error: &ArchiveError) -> ArchiveOutcome {
        tracing::info!(
            target = "archivist::archive",
            request_id = %request.request_id,
            disposition = "rejected",
            code = %error.code(),
            error = %error,
            "request rejected"
        );
        ArchiveOutcome::failure(request.request_id, self.host_id(), error)
    }

    pub(super) fn resolve_mime_type(&self, request: &ArchiveRequest) -> Result<String> {
        if request.filename.trim().is_empty() {
            return Err(ArchiveError::InvalidRequest("missing file name".into()));
        }
        if let Some(mime_type) = request
            .mime_type
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
        {
            return Ok(mime_type.to_ascii_lowercase());
        }
        self.config
            .mime_type_for(&request.filename)
            .map(str::to_string)
            .ok_or_else(|| ArchiveError::UnknownMimeType {
                mime_type: format!("<none for {}>", request.filename),
            })
    }

    fn should_proxy(&self, mime_type: &str) -> bool {
        self.proxy.has_units(mime_type)
            && (self.config.proxy.multiplex
                || !self.registry.is_eligible_locally()
                || !self.registry.has_local_route(mime_type))
    }

    fn proxy_push(
        &self,
        request: &ArchiveRequest,
        mime_type: &str,
        body: &mut dyn Read,
    ) -> ArchiveOutcome {
        let spool = match self.spool(request, body) {
            Ok(spool) => spool,
            Err(err) => return self.reject(request, &err),
        };
        let local = |req: &ArchiveRequest, forwarded: ForwardBody<'_>| match forwarded {
            ForwardBody::File(path) => match fs_err::File::open(path) {
                Ok(mut file) => self.archive_local(req, mime_type, &mut file),
                Err(err) => self.reject(req, &ArchiveError::from(err)),
            },
            ForwardBody::None => self.pull_local(req, mime_type),
        };
        match self
            .proxy
            .route(request, mime_type, ForwardBody::File(spool.path()), &local)
        {
            Ok(outcome) => outcome,
            Err(err) => self.reject(request, &err),
        }
    }

    /// Buffer a push body so it can be offered to more than one unit.
    fn spool(
        &self,
        request: &ArchiveRequest,
        body: &mut dyn Read,
    ) -> Result<tempfile::NamedTempFile> {
        let mut spool = tempfile::Builder::new()
            .prefix("archivist-spool-")
            .tempfile()?;
        let mut buf = vec![0u8; self.config.block_size.max(1)];
        let mut total = 0u64;
        loop {
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(ArchiveError::Cancelled {
                        reason: err.to_string(),
                    });
                }
            };
            if let Some(limit) = self.config.max_file_size {
                if total + n as u64 > limit {
                    return Err(ArchiveError::QuotaExceeded { limit });
                }
            }
            spool.write_all(&buf[..n])?;
            total += n as u64;
        }
        spool.flush()?;
        if total == 0 {
            return Err(ArchiveError::ZeroLengthFile {
                filename: request.filename.clone(),
            });
        }
        if let ArchiveSource::Push {
            content_length: Some(expected),
        } = request.source
        {
            if expected != total {
                return Err(ArchiveError::Cancelled {
                    reason: format!("received {total} of {expected} bytes"),
                });
            }
        }
        Ok(spool)
    }
}

fn quarantine_tag(error: &ArchiveError) -> QuarantineTag {
    match error {
        ArchiveError::BadFile { .. }
        | ArchiveError::UnsupportedMimeType { .. }
        | ArchiveError::HandlerUnavailable { .. } => QuarantineTag::Validation,
        _ => QuarantineTag::Unretryable,
    }
}

fn drop_sidecar(sidecar: &Path) {
    if let Err(err) = remove_if_exists(sidecar) {
        tracing::warn!(
            target = "archivist::archive",
            path = %sidecar.display(),
            error = %err,
            "failed to remove request sidecar"
        );
    }
}
