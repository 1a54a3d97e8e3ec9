//! Pull locators (`file:` and `http(s):`) and the readers behind them.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{ArchiveError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    File(PathBuf),
    Http(Url),
}

/// An opened pull source.
pub struct PullSource {
    pub reader: Box<dyn Read + Send>,
    /// Length announced by the source, when known.
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for PullSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullSource")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Parse a pull locator. Bare absolute paths are accepted as `file:` locators.
pub fn parse_locator(raw: &str) -> Result<Locator> {
    let raw = raw.trim();
    if raw.starts_with('/') {
        return Ok(Locator::File(PathBuf::from(raw)));
    }
    let url = Url::parse(raw)
        .map_err(|err| ArchiveError::InvalidRequest(format!("bad locator {raw}: {err}")))?;
    match url.scheme() {
        "file" => url
            .to_file_path()
            .map(Locator::File)
            .map_err(|()| ArchiveError::InvalidRequest(format!("bad file locator {raw}"))),
        "http" | "https" => Ok(Locator::Http(url)),
        other => Err(ArchiveError::InvalidRequest(format!(
            "unsupported locator scheme {other}"
        ))),
    }
}

fn pull_error(url: &str, reason: impl ToString, retryable: bool) -> ArchiveError {
    ArchiveError::Pull {
        url: url.to_string(),
        reason: reason.to_string(),
        retryable,
    }
}

/// Open a locator for reading. Missing files and HTTP 4xx replies are terminal; timeouts,
/// connection failures and HTTP 5xx replies are retryable.
pub fn open_locator(raw: &str, timeout: Duration) -> Result<PullSource> {
    match parse_locator(raw)? {
        Locator::File(path) => {
            let file = fs_err::File::open(&path).map_err(|err| {
                let retryable = err.kind() != std::io::ErrorKind::NotFound;
                pull_error(raw, err, retryable)
            })?;
            let content_length = file.metadata().ok().map(|m| m.len());
            Ok(PullSource {
                reader: Box::new(file),
                content_length,
            })
        }
        Locator::Http(url) => open_http(raw, url, timeout),
    }
}

#[cfg(feature = "http")]
fn open_http(raw: &str, url: Url, timeout: Duration) -> Result<PullSource> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| pull_error(raw, err, false))?;
    let response = client
        .get(url)
        .send()
        .map_err(|err| pull_error(raw, err, true))?;
    let status = response.status();
    if status.is_client_error() {
        return Err(pull_error(raw, format!("HTTP {status}"), false));
    }
    if !status.is_success() {
        return Err(pull_error(raw, format!("HTTP {status}"), true));
    }
    let content_length = response.content_length();
    Ok(PullSource {
        reader: Box::new(response),
        content_length,
    })
}

#[cfg(not(feature = "http"))]
fn open_http(raw: &str, _url: Url, _timeout: Duration) -> Result<PullSource> {
    Err(pull_error(raw, "HTTP support is not compiled in", false))
}
