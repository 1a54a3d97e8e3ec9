//! Content handlers: format-specific validation and transformation, keyed by mime-type.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::error::ArchiveError;

/// What a handler is given.
#[derive(Debug, Clone, Copy)]
pub struct HandlerInput<'a> {
    pub staged_path: &'a Path,
    pub mime_type: &'a str,
    pub file_id: &'a str,
    pub params: &'a BTreeMap<String, String>,
}

/// What a handler returns on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutput {
    /// Location of the final bytes; equal to the staged path unless the handler rewrote them.
    pub final_path: PathBuf,
    pub final_mime_type: String,
    pub metadata: BTreeMap<String, String>,
    /// Overrides the request's file id (e.g. one derived from file headers).
    pub file_id: Option<String>,
    /// The bytes changed, so the staging checksum no longer applies.
    pub rewritten: bool,
}

impl HandlerOutput {
    #[must_use]
    pub fn unchanged(input: &HandlerInput<'_>) -> Self {
        Self {
            final_path: input.staged_path.to_path_buf(),
            final_mime_type: input.mime_type.to_string(),
            metadata: BTreeMap::new(),
            file_id: None,
            rewritten: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    BadFile(String),
    #[error("unsupported mime-type {0}")]
    UnsupportedMimeType(String),
    #[error("handler unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    /// Map into the crate taxonomy. Everything but I/O on the staged file is terminal.
    pub(crate) fn into_archive_error(self, handler: &str, filename: &str, mime_type: &str) -> ArchiveError {
        match self {
            Self::BadFile(reason) => ArchiveError::BadFile {
                filename: filename.to_string(),
                reason,
            },
            Self::UnsupportedMimeType(mime_type) => ArchiveError::UnsupportedMimeType {
                handler: handler.to_string(),
                mime_type,
            },
            Self::Unavailable(reason) => ArchiveError::HandlerUnavailable {
                mime_type: mime_type.to_string(),
                reason,
            },
            Self::Io(err) => ArchiveError::Io(err),
        }
    }
}

pub trait ContentHandler: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    fn handle(&self, input: &HandlerInput<'_>) -> Result<HandlerOutput, HandlerError>;
}

/// Mime-type to handler mapping, with an optional fallback.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ContentHandler>>,
    fallback: Option<Arc<dyn ContentHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field(
                "handlers",
                &self
                    .handlers
                    .iter()
                    .map(|(mime, h)| (mime.as_str(), h.name()))
                    .collect::<Vec<_>>(),
            )
            .field("fallback", &self.fallback.as_ref().map(|h| h.name()))
            .finish()
    }
}

impl HandlerRegistry {
    /// An empty registry: every lookup fails until handlers are registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Passthrough for every mime-type, FITS validation for `image/x-fits`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("image/x-fits", FitsHandler);
        registry.set_fallback(PassthroughHandler);
        registry
    }

    pub fn register<H>(&mut self, mime_type: &str, handler: H)
    where
        H: ContentHandler + 'static,
    {
        self.handlers
            .insert(mime_type.to_ascii_lowercase(), Arc::new(handler));
    }

    pub fn set_fallback<H>(&mut self, handler: H)
    where
        H: ContentHandler + 'static,
    {
        self.fallback = Some(Arc::new(handler));
    }

    pub fn resolve(&self, mime_type: &str) -> crate::Result<Arc<dyn ContentHandler>> {
        self.handlers
            .get(&mime_type.to_ascii_lowercase())
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ArchiveError::HandlerUnavailable {
                mime_type: mime_type.to_string(),
                reason: "no handler registered".into(),
            })
    }
}

/// Accepts any bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughHandler;

impl ContentHandler for PassthroughHandler {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn handle(&self, input: &HandlerInput<'_>) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::unchanged(input))
    }
}

const FITS_BLOCK: u64 = 2880;
const FITS_MAGIC: &[u8] = b"SIMPLE  =";

/// Structural check for FITS files: primary header magic and whole 2880-byte blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct FitsHandler;

impl ContentHandler for FitsHandler {
    fn name(&self) -> &str {
        "fits"
    }

    fn handle(&self, input: &HandlerInput<'_>) -> Result<HandlerOutput, HandlerError> {
        let size = fs_err::metadata(input.staged_path)?.len();
        if size % FITS_BLOCK != 0 {
            return Err(HandlerError::BadFile(format!(
                "File size not a multiple of {FITS_BLOCK} (size: {size})"
            )));
        }
        let mut magic = [0u8; FITS_MAGIC.len()];
        fs_err::File::open(input.staged_path)?.read_exact(&mut magic)?;
        if magic != FITS_MAGIC {
            return Err(HandlerError::BadFile(
                "missing SIMPLE keyword in primary header".into(),
            ));
        }
        let mut output = HandlerOutput::unchanged(input);
        output
            .metadata
            .insert("fits.blocks".into(), (size / FITS_BLOCK).to_string());
        Ok(output)
    }
}
