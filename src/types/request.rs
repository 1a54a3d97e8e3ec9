//! Per-request description of an archive attempt.
//!
//! The request is the unit serialized into sidecars and back-log records, so every field
//! round-trips through `serde`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::{Checksum, ChecksumVariant};

/// Where the bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArchiveSource {
    /// Bytes are streamed in the request body.
    Push {
        #[serde(default)]
        content_length: Option<u64>,
    },
    /// The server fetches the bytes from a `file:` or `http(s):` locator.
    Pull { url: String },
}

/// Which version a committed file receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionRequest {
    #[default]
    Auto,
    Explicit(u32),
}

/// Checksum policy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumChoice {
    /// Use the server's configured variant.
    #[default]
    Default,
    Variant(ChecksumVariant),
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub request_id: Uuid,
    pub source: ArchiveSource,
    /// Client-side file name; used for the file id when none is given.
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub version: VersionRequest,
    #[serde(default)]
    pub no_versioning: bool,
    #[serde(default)]
    pub checksum: ChecksumChoice,
    /// Parameters passed verbatim to the content handler.
    #[serde(default)]
    pub handler_params: BTreeMap<String, String>,
    pub accepted_at: DateTime<Utc>,
}

impl ArchiveRequest {
    fn new(source: ArchiveSource, filename: String) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            source,
            filename,
            mime_type: None,
            file_id: None,
            version: VersionRequest::Auto,
            no_versioning: false,
            checksum: ChecksumChoice::Default,
            handler_params: BTreeMap::new(),
            accepted_at: Utc::now(),
        }
    }

    /// A request whose bytes arrive in the request body.
    #[must_use]
    pub fn push(filename: impl Into<String>) -> Self {
        Self::new(
            ArchiveSource::Push {
                content_length: None,
            },
            filename.into(),
        )
    }

    /// A request the server must fetch itself. The file name defaults to the last
    /// path segment of the locator.
    #[must_use]
    pub fn pull(url: impl Into<String>) -> Self {
        let url = url.into();
        let filename = url
            .split(['?', '#'])
            .next()
            .unwrap_or(&url)
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self::new(ArchiveSource::Pull { url }, filename)
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    #[must_use]
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = VersionRequest::Explicit(version);
        self
    }

    #[must_use]
    pub fn with_content_length(mut self, length: u64) -> Self {
        if let ArchiveSource::Push { content_length } = &mut self.source {
            *content_length = Some(length);
        }
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, choice: ChecksumChoice) -> Self {
        self.checksum = choice;
        self
    }

    #[must_use]
    pub fn with_handler_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.handler_params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn no_versioning(mut self) -> Self {
        self.no_versioning = true;
        self
    }

    /// File id the request will be cataloged under.
    #[must_use]
    pub fn effective_file_id(&self) -> String {
        match &self.file_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => base_name(&self.filename).to_string(),
        }
    }

    /// Name used for scratch, back-log and bad files of this request.
    #[must_use]
    pub fn scratch_name(&self) -> String {
        format!("{}-{}", self.request_id, sanitize(base_name(&self.filename)))
    }
}

fn base_name(name: &str) -> &str {
    name.trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
}

/// Replace characters that are unsafe in a single path component.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

/// A finalized scratch file, ready for the content handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub sidecar: PathBuf,
    pub disk_id: String,
    pub size: u64,
    pub checksum: Option<Checksum>,
}

/// Output of a successful content-handler run, plus the digest of the final bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedFile {
    pub file_id: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub checksum: Option<Checksum>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_request_takes_filename_from_url() {
        let req = ArchiveRequest::pull("http://archive.example.org/data/SmallFile.fits?x=1");
        assert_eq!(req.filename, "SmallFile.fits");
        assert_eq!(req.effective_file_id(), "SmallFile.fits");
    }

    #[test]
    fn explicit_file_id_wins() {
        let req = ArchiveRequest::push("dir/obs.fits").with_file_id(" OBS-1 ");
        assert_eq!(req.effective_file_id(), "OBS-1");
        let req = ArchiveRequest::push("dir/obs.fits");
        assert_eq!(req.effective_file_id(), "obs.fits");
    }

    #[test]
    fn scratch_name_is_a_single_component() {
        let req = ArchiveRequest::push("../../etc/passwd");
        let name = req.scratch_name();
        assert!(!name.contains('/'));
        assert!(name.ends_with("-passwd"));
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = ArchiveRequest::push("a.fits")
            .with_mime_type("image/x-fits")
            .with_version(3)
            .with_checksum(ChecksumChoice::Variant(ChecksumVariant::Blake3))
            .with_handler_param("compression", "gzip");
        let json = serde_json::to_string(&req).unwrap();
        let back: ArchiveRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
