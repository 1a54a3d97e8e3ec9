//! Archiving proxy: ordered-fallback forwarding to the units of an archiving cluster.
//!
//! Units are tried in configured order. A unit that was recently offline or out of storage is
//! demoted behind the others until its mark expires; marks are advisory and never exclude a
//! unit outright.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, ErrorCode, Result};
use crate::types::{ArchiveOutcome, ArchiveRequest, ArchiveStatus, ArchivingUnit};

/// Stream key whose units serve every mime-type without its own list.
pub const ANY_MIME_TYPE: &str = "*";

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("unit {0} is offline")]
    Offline(String),
    #[error("forwarding to {0} timed out")]
    Timeout(String),
    #[error("protocol error talking to {unit}: {reason}")]
    Protocol { unit: String, reason: String },
}

/// What is forwarded along with the request description.
#[derive(Debug, Clone, Copy)]
pub enum ForwardBody<'a> {
    /// Spooled push body.
    File(&'a Path),
    /// Pull request; the unit fetches the locator itself.
    None,
}

pub trait UnitTransport: Send + Sync {
    fn forward(
        &self,
        unit: &ArchivingUnit,
        request: &ArchiveRequest,
        mime_type: &str,
        body: ForwardBody<'_>,
        timeout: Duration,
    ) -> std::result::Result<ArchiveOutcome, ForwardError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Offline,
    NoFreeStorage,
}

pub struct ProxyRouter {
    units: BTreeMap<String, Vec<ArchivingUnit>>,
    marks: Mutex<HashMap<ArchivingUnit, (UnitStatus, Instant)>>,
    status_ttl: Duration,
    forward_timeout: Duration,
    local_host_id: String,
    transport: Arc<dyn UnitTransport>,
}

impl std::fmt::Debug for ProxyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRouter")
            .field("units", &self.units)
            .field("status_ttl", &self.status_ttl)
            .field("forward_timeout", &self.forward_timeout)
            .field("local_host_id", &self.local_host_id)
            .finish_non_exhaustive()
    }
}

impl ProxyRouter {
    #[must_use]
    pub fn new(config: &ArchiveConfig, transport: Arc<dyn UnitTransport>) -> Self {
        let units = config
            .streams
            .iter()
            .filter(|s| !s.units.is_empty())
            .map(|s| (s.mime_type.to_ascii_lowercase(), s.units.clone()))
            .collect();
        Self {
            units,
            marks: Mutex::new(HashMap::new()),
            status_ttl: config.proxy.unit_status_ttl(),
            forward_timeout: config.proxy.forward_timeout(),
            local_host_id: config.host_id.clone(),
            transport,
        }
    }

    /// Whether any unit is configured for the mime-type.
    #[must_use]
    pub fn has_units(&self, mime_type: &str) -> bool {
        !self.configured_units(mime_type).is_empty()
    }

    fn configured_units(&self, mime_type: &str) -> &[ArchivingUnit] {
        self.units
            .get(&mime_type.to_ascii_lowercase())
            .or_else(|| self.units.get(ANY_MIME_TYPE))
            .map_or(&[][..], Vec::as_slice)
    }

    /// Try order for a mime-type: unmarked units first, then marked ones, each group in
    /// configured order.
    pub fn candidates(&self, mime_type: &str) -> Vec<ArchivingUnit> {
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.status_ttl;
        marks.retain(|_, (_, since)| since.elapsed() < ttl);
        let (healthy, demoted): (Vec<_>, Vec<_>) = self
            .configured_units(mime_type)
            .iter()
            .cloned()
            .partition(|unit| !marks.contains_key(unit));
        healthy.into_iter().chain(demoted).collect()
    }

    pub fn mark(&self, unit: &ArchivingUnit, status: UnitStatus) {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit.clone(), (status, Instant::now()));
    }

    fn clear(&self, unit: &ArchivingUnit) {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(unit);
    }

    #[must_use]
    pub fn status(&self, unit: &ArchivingUnit) -> Option<UnitStatus> {
        let marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        marks
            .get(unit)
            .filter(|(_, since)| since.elapsed() < self.status_ttl)
            .map(|(status, _)| *status)
    }

    /// Forward `request` to the first unit that accepts it. A unit whose host id is this
    /// server's own is served by `local`.
    pub fn route(
        &self,
        request: &ArchiveRequest,
        mime_type: &str,
        body: ForwardBody<'_>,
        local: &dyn Fn(&ArchiveRequest, ForwardBody<'_>) -> ArchiveOutcome,
    ) -> Result<ArchiveOutcome> {
        let candidates = self.candidates(mime_type);
        if candidates.is_empty() {
            return Err(ArchiveError::ProxyExhausted {
                tried: 0,
                last_error: format!("no archiving units configured for {mime_type}"),
            });
        }
        let mut last_error = String::new();
        let mut tried = 0;
        for unit in candidates {
            tried += 1;
            let host_id = unit.host_id();
            let reply = if host_id == self.local_host_id {
                Ok(local(request, body))
            } else {
                self.transport
                    .forward(&unit, request, mime_type, body, self.forward_timeout)
            };
            match reply {
                Ok(mut outcome) if outcome.status != ArchiveStatus::Failure => {
                    self.clear(&unit);
                    outcome.host_id = host_id;
                    tracing::info!(
                        target = "archivist::proxy",
                        request_id = %request.request_id,
                        unit = %unit,
                        status = ?outcome.status,
                        tried,
                        "request forwarded"
                    );
                    return Ok(outcome);
                }
                Ok(outcome) if is_capacity_failure(outcome.code) => {
                    tracing::info!(
                        target = "archivist::proxy",
                        request_id = %request.request_id,
                        unit = %unit,
                        "unit has no free storage; trying next"
                    );
                    self.mark(&unit, UnitStatus::NoFreeStorage);
                    last_error = format!("{unit}: {}", outcome.message);
                }
                Ok(outcome) => {
                    // the request itself was rejected; another unit would do the same
                    return Ok(outcome);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "archivist::proxy",
                        request_id = %request.request_id,
                        unit = %unit,
                        error = %err,
                        "forwarding failed; trying next unit"
                    );
                    self.mark(&unit, UnitStatus::Offline);
                    last_error = err.to_string();
                }
            }
        }
        Err(ArchiveError::ProxyExhausted { tried, last_error })
    }
}

fn is_capacity_failure(code: Option<ErrorCode>) -> bool {
    matches!(
        code,
        Some(
            ErrorCode::NoFreeStorageSet
                | ErrorCode::DiskCompleted
                | ErrorCode::QuotaExceeded
                | ErrorCode::ProxyExhausted
        )
    )
}

/// Transport for builds without HTTP support: every remote unit is unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineTransport;

impl UnitTransport for OfflineTransport {
    fn forward(
        &self,
        unit: &ArchivingUnit,
        _: &ArchiveRequest,
        _: &str,
        _: ForwardBody<'_>,
        _: Duration,
    ) -> std::result::Result<ArchiveOutcome, ForwardError> {
        Err(ForwardError::Offline(unit.to_string()))
    }
}

/// Blocking HTTP transport: `POST http://<host>:<port>/ARCHIVE` with a JSON outcome reply.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpUnitTransport {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpUnitTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn classify(unit: &ArchivingUnit, err: &reqwest::Error) -> ForwardError {
        if err.is_timeout() {
            ForwardError::Timeout(unit.to_string())
        } else if err.is_connect() {
            ForwardError::Offline(unit.to_string())
        } else {
            ForwardError::Protocol {
                unit: unit.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(feature = "http")]
impl UnitTransport for HttpUnitTransport {
    fn forward(
        &self,
        unit: &ArchivingUnit,
        request: &ArchiveRequest,
        mime_type: &str,
        body: ForwardBody<'_>,
        timeout: Duration,
    ) -> std::result::Result<ArchiveOutcome, ForwardError> {
        use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};

        let url = format!("http://{}:{}/ARCHIVE", unit.host, unit.port);
        let mut query: Vec<(&str, String)> = vec![("mime_type", mime_type.to_string())];
        if let Some(file_id) = &request.file_id {
            query.push(("file_id", file_id.clone()));
        }
        if let crate::types::VersionRequest::Explicit(version) = request.version {
            query.push(("file_version", version.to_string()));
        }
        if request.no_versioning {
            query.push(("no_versioning", "1".into()));
        }
        for (key, value) in &request.handler_params {
            query.push((key.as_str(), value.clone()));
        }
        let builder = self.client.post(&url).timeout(timeout);
        let builder = match (&request.source, body) {
            (_, ForwardBody::File(path)) => {
                let file = fs_err::File::open(path).map_err(|err| ForwardError::Protocol {
                    unit: unit.to_string(),
                    reason: format!("cannot reopen spooled body: {err}"),
                })?;
                let len = file.metadata().map(|m| m.len()).unwrap_or(0);
                let (file, _) = file.into_parts();
                builder
                    .query(&query)
                    .header(CONTENT_TYPE, mime_type)
                    .header(
                        CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{}\"", request.filename),
                    )
                    .body(reqwest::blocking::Body::sized(file, len))
            }
            (crate::types::ArchiveSource::Pull { url: locator }, ForwardBody::None) => {
                query.push(("filename", locator.clone()));
                builder.query(&query)
            }
            (crate::types::ArchiveSource::Push { .. }, ForwardBody::None) => {
                return Err(ForwardError::Protocol {
                    unit: unit.to_string(),
                    reason: "push request without a body".into(),
                });
            }
        };
        let response = builder.send().map_err(|err| Self::classify(unit, &err))?;
        response
            .json::<ArchiveOutcome>()
            .map_err(|err| Self::classify(unit, &err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;

    struct Scripted;

    impl UnitTransport for Scripted {
        fn forward(
            &self,
            unit: &ArchivingUnit,
            request: &ArchiveRequest,
            _: &str,
            _: ForwardBody<'_>,
            _: Duration,
        ) -> std::result::Result<ArchiveOutcome, ForwardError> {
            match unit.port {
                1 => Err(ForwardError::Offline(unit.to_string())),
                2 => Ok(ArchiveOutcome::failure(
                    request.request_id,
                    &unit.host_id(),
                    &ArchiveError::NoFreeStorageSet {
                        mime_type: "image/x-fits".into(),
                    },
                )),
                _ => Ok(ArchiveOutcome::success(
                    request.request_id,
                    "remote",
                    "f",
                    1,
                    "d",
                    1,
                    None,
                )),
            }
        }
    }

    fn router(ports: &[u16], host_id: &str) -> ProxyRouter {
        let config = ArchiveConfig {
            host_id: host_id.into(),
            streams: vec![StreamConfig {
                mime_type: "image/x-fits".into(),
                storage_sets: Vec::new(),
                units: ports.iter().map(|p| ArchivingUnit::new("node", *p)).collect(),
            }],
            ..ArchiveConfig::default()
        };
        ProxyRouter::new(&config, Arc::new(Scripted))
    }

    fn no_local(request: &ArchiveRequest, _: ForwardBody<'_>) -> ArchiveOutcome {
        ArchiveOutcome::failure(request.request_id, "local", &ArchiveError::Lock("unused".into()))
    }

    #[test]
    fn falls_back_in_order_and_demotes_failed_units() {
        let router = router(&[1, 2, 3], "self:9");
        let request = ArchiveRequest::pull("file:///in/a.fits");
        let outcome = router
            .route(&request, "image/x-fits", ForwardBody::None, &no_local)
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.host_id, "node:3");
        assert_eq!(router.status(&ArchivingUnit::new("node", 1)), Some(UnitStatus::Offline));
        assert_eq!(
            router.status(&ArchivingUnit::new("node", 2)),
            Some(UnitStatus::NoFreeStorage)
        );
        let order: Vec<u16> = router
            .candidates("image/x-fits")
            .iter()
            .map(|u| u.port)
            .collect();
        assert_eq!(order, [3, 1, 2]);
    }

    #[test]
    fn exhaustion_is_reported() {
        let router = router(&[1, 2], "self:9");
        let request = ArchiveRequest::pull("file:///in/a.fits");
        let err = router
            .route(&request, "image/x-fits", ForwardBody::None, &no_local)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ProxyExhausted { tried: 2, .. }));
        assert!(matches!(
            router.route(&request, "text/plain", ForwardBody::None, &no_local),
            Err(ArchiveError::ProxyExhausted { tried: 0, .. })
        ));
    }

    #[test]
    fn local_unit_is_served_in_process() {
        let router = router(&[7, 3], "node:7");
        let request = ArchiveRequest::pull("file:///in/a.fits");
        let local = |r: &ArchiveRequest, _: ForwardBody<'_>| {
            ArchiveOutcome::success(r.request_id, "x", "f", 1, "p1", 1, None)
        };
        let outcome = router
            .route(&request, "image/x-fits", ForwardBody::None, &local)
            .unwrap();
        assert_eq!(outcome.host_id, "node:7");
        assert_eq!(outcome.disk_id.as_deref(), Some("p1"));
    }
}
